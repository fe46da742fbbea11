pub mod cache;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod health;
pub mod logger;
pub mod monitor;
pub mod pricing;
pub mod quota;
pub mod router;
pub mod server;
pub mod session;

/// Bootstrap and run the proxy: initialize storage and logging, load the
/// persisted quota cache, start the background loops (health prober, cache
/// janitor, session sweeper), then serve the axum app until shutdown.
pub async fn run() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        crate::logger::error("panic", &format!("panic: message='{message}', location='{location}'"));
        eprintln!("FATAL PANIC: {message} at {location}");
    }));

    db::init();
    logger::init();
    logger::info("app", "ccnexus starting");

    quota::init();
    health::spawn();
    cache::spawn_janitor();
    session::spawn_sweeper();

    server::serve().await;
}
