use anyhow::{anyhow, bail, Context};
use notesync_lib::{bridge::server, config, invoke_bridge, run_host};
use serde_json::Value;

const USAGE: &str = "usage: notesync [--bridge | invoke <op> [payload-json]]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => {
            let data_dir = config::resolve_data_dir()?;
            run_host(&data_dir).await
        }
        Some("--bridge") => {
            server::run_stdio();
            Ok(())
        }
        Some("invoke") => {
            let op = args.next().ok_or_else(|| anyhow!(USAGE))?;
            let payload = match args.next() {
                Some(raw) => serde_json::from_str(&raw).context("payload must be a JSON object")?,
                None => Value::Object(Default::default()),
            };
            let data_dir = config::resolve_data_dir()?;
            let data = invoke_bridge(&data_dir, &op, payload).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(())
        }
        Some("--help") | Some("-h") => {
            println!("{}", USAGE);
            Ok(())
        }
        Some(other) => bail!("unknown argument '{}'; {}", other, USAGE),
    }
}
