use std::fmt::Display;
use std::process;
use std::sync::Arc;

use serde_json::json;

use wukongqueue::config::AppConfig;
use wukongqueue::heartbeat::StatusHeartbeat;
use wukongqueue::logging::{LogLevel, Logger, LoggerConfig};
use wukongqueue::queue::{BlockingQueue, QueueConfig};
use wukongqueue::registry::ConnectionRegistry;
use wukongqueue::server::TcpServer;
use wukongqueue::session::SessionContext;
use wukongqueue::shutdown::ShutdownHooks;
use wukongqueue::utils::startup_banner::print_startup_banner;
use wukongqueue::wire::codec::WireCodec;

fn main() {
    let app_config = or_exit(
        "configuration error",
        AppConfig::load_with_discovery(std::env::args().skip(1)),
    );
    print_startup_banner(app_config.logging.human_friendly);

    let logger = Arc::new(Logger::new(LoggerConfig::from(&app_config.logging)));
    let codec = or_exit("wire codec configuration error", WireCodec::from_app_config(&app_config));
    let server = or_exit("server startup error", TcpServer::from_app_config(&app_config));
    let bound_addr = or_exit("server startup error", server.local_addr());

    let queue = Arc::new(BlockingQueue::new(QueueConfig::from(&app_config.queue)));
    let registry = Arc::new(ConnectionRegistry::new());
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "max_size": queue.capacity(),
            "max_frame_size_bytes": codec.max_frame_size_bytes(),
        })),
    );

    let shutdown_hooks = or_exit("failed to install shutdown hooks", ShutdownHooks::install());
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let mut heartbeat = match app_config.heartbeat.interval_ms {
        0 => None,
        interval_ms => {
            let mut heartbeat = or_exit(
                "heartbeat configuration error",
                StatusHeartbeat::new(
                    interval_ms,
                    Arc::clone(&queue),
                    Arc::clone(&registry),
                    Arc::clone(&logger),
                ),
            );
            or_exit("heartbeat startup error", heartbeat.start());
            logger.log(
                LogLevel::Info,
                Some("main::heartbeat"),
                "Status heartbeat started",
                Some(heartbeat.describe()),
            );
            Some(heartbeat)
        }
    };

    let context = SessionContext::new(queue, registry, codec, Arc::clone(&logger));
    let served = server.serve(&context, shutdown_hooks.signal());

    logger.info(
        Some("main::shutdown"),
        "Accept loop stopped, finishing graceful shutdown",
    );
    if let Some(heartbeat) = heartbeat.as_mut() {
        if let Err(error) = heartbeat.stop() {
            logger.warn(Some("main::shutdown"), &error.to_string());
        }
    }

    if let Err(error) = served {
        logger.error(Some("main::server"), &error.to_string());
        process::exit(2);
    }
    logger.info(Some("main::shutdown"), "Server stopped and shutdown completed");
}

fn or_exit<T, E: Display>(label: &str, result: Result<T, E>) -> T {
    result.unwrap_or_else(|error| {
        eprintln!("{label}: {error}");
        process::exit(2);
    })
}
