fn main() {
    if let Err(e) = leadsync_lib::run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
