fn main() {
    #[cfg(feature = "cli")]
    stepcache::cli::run();

    #[cfg(not(feature = "cli"))]
    {
        eprintln!("stepcache: CLI not enabled. Rebuild with `--features cli`.");
        std::process::exit(1);
    }
}
