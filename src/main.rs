#[tokio::main]
async fn main() {
    pgclone::cli::main().await;
}
