fn main() {
    if let Err(err) = shotsync_lib::run() {
        eprintln!("shotsync: {err:#}");
        std::process::exit(1);
    }
}
