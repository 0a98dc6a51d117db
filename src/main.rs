fn main() {
    hmc_analysis::cli::run();
}
