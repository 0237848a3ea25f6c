use mock_service::AppState;
use std::sync::OnceLock;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[allow(unused)]
pub fn init() {
    static ONCE_LOCK: OnceLock<()> = OnceLock::new();

    ONCE_LOCK.get_or_init(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            error!("Panic occurred: {info:?}");
        }));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("trapeze=debug,mock_service=info"))
            .with_test_writer()
            .try_init();
    });
}

/// Start a mock service on an ephemeral port and return its base URL.
#[allow(unused)]
pub async fn serve(state: AppState) -> String {
    init();
    let addr = mock_service::spawn(state)
        .await
        .expect("mock service failed to bind");
    format!("http://{addr}")
}
