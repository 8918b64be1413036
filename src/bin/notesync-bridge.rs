fn main() {
    notesync_lib::bridge::server::run_stdio();
}
