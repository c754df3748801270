#[tokio::main]
async fn main() {
    let code = heartmula_launcher::run().await;
    std::process::exit(code);
}
