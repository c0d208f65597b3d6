fn main() {
    std::process::exit(testmon::cli::run());
}
