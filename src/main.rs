use taskdeck::error::AppResult;

#[tokio::main]
async fn main() -> AppResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    taskdeck::run().await
}
