#[tokio::main]
async fn main() {
    ccnexus::run().await;
}
