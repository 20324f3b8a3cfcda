// Game Panel Setup - main entry point

#[tokio::main]
async fn main() {
    gamepanel_setup_lib::init_tracing();

    if let Err(e) = gamepanel_setup_lib::run().await {
        tracing::error!("Setup service failed: {}", e);
        std::process::exit(1);
    }
}
