fn main() -> Result<(), Box<dyn std::error::Error>> {
    chatstate::cli::main()
}
