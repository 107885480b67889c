#[tokio::main]
async fn main() {
    if let Err(err) = waflow::app::run().await {
        eprintln!("waflow-server: {err}");
        std::process::exit(1);
    }
}
