#[tokio::main]
async fn main() {
    injapan_affiliate::start_server().await;
}
