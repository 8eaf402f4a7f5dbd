use std::process;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cluster_node::claimcheck::ClaimCheckStore;
use cluster_node::config::AppConfig;
use cluster_node::logging::{LogLevel, Logger, LoggerConfig};
use cluster_node::node::{NodeContext, NodeRequest};
use cluster_node::server::NodeServer;
use cluster_node::shutdown::ShutdownHooks;
use cluster_node::wire::FramedMessenger;

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

fn main() {
    print_startup_banner();

    let app_config = load_config_or_exit();
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });

    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
        ..LoggerConfig::default()
    }));

    let store = ClaimCheckStore::from_app_config(&app_config, Arc::clone(&logger))
        .unwrap_or_else(|error| {
            eprintln!("claim-check configuration error: {error}");
            process::exit(2);
        });
    let context = Arc::new(NodeContext::new(store, Arc::clone(&logger)));

    let server = NodeServer::from_app_config(
        &app_config,
        Arc::clone(&context),
        FramedMessenger::<NodeRequest>::new(app_config.server.max_frame_bytes),
        Arc::clone(&logger),
    )
    .unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    server.start().unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} accepting requests",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": server.local_addr().to_string(),
            "socket_threads": server.num_socket_threads(),
            "handler_threads": server.num_handler_threads(),
            "max_frame_bytes": app_config.server.max_frame_bytes,
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    shutdown_hooks.wait(SHUTDOWN_POLL);
    logger.info(Some("main::shutdown"), "Stop requested, draining server");

    let mut exit_code = 0;
    if let Err(error) = server.shutdown(false) {
        logger.error(Some("main::shutdown"), &format!("server shutdown failed: {error}"));
        exit_code = 1;
    }
    if let Err(error) = context.store.shutdown(false) {
        logger.error(
            Some("main::shutdown"),
            &format!("claim-check shutdown failed: {error}"),
        );
        exit_code = 1;
    }
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Stopped",
        Some(json!({ "stats": server.stats_snapshot() })),
    );
    process::exit(exit_code);
}

fn load_config_or_exit() -> AppConfig {
    AppConfig::load_with_discovery(std::env::args().skip(1)).unwrap_or_else(|error| {
        eprintln!("configuration error: {error}");
        process::exit(2);
    })
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";
    const APP_DESCRIPTION: &str =
        "Cluster node: tiered worker pools in front of a claim-check store.";

    println!("{BANNER_COLOR}{} v{}{RESET}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    println!("{APP_DESCRIPTION}");
    println!();
    println!("================================================================");
    println!();
}
