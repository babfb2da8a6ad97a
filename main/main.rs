fn main() {
    if let Err(e) = elise::core::main::run_elise() {
        // a single-line diagnostic, then a non-zero exit
        eprintln!("elise: {e:#}");
        std::process::exit(1);
    }
}
