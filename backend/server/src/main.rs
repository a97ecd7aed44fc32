#[tokio::main]
async fn main() -> anyhow::Result<()> {
    survey_server::start_server().await
}
