use chrono::Utc;
use log::{error, info};
use machmon::daemon::downtime::DowntimeTracker;
use machmon::daemon::pipeline::{spawn_pipeline, Pipeline, PipelineConfig, PipelineResources};
use machmon::daemon::sensor::build_sensor;
use machmon::daemon::server::http::{spawn_http_server, ApiState};
use machmon::daemon::shift::ShiftCalendar;
use machmon::daemon::snapshot::SnapshotBus;
use machmon::storage::sqlite3::SqliteStore;
use machmon::storage::MachineStore;
use machmon::util::config::AppConfig;
use machmon::util::logging::{new_run_id, set_run_id};
use machmon::util::paths;
use machmon::util::threading::ThreadRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn ensure_workspace_dir(workspace_dir: &Path) {
    if !workspace_dir.exists() {
        std::fs::create_dir_all(workspace_dir).unwrap_or_else(|e| {
            eprintln!("Failed to create workspace directory: {}", e);
            std::process::exit(1);
        });
    }
}

fn is_process_running(pid: u32) -> bool {
    std::process::Command::new("ps")
        .args(["-p", &pid.to_string()])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn write_pid_file(pid_file: &PathBuf) {
    if pid_file.exists() {
        match std::fs::read_to_string(pid_file) {
            Ok(content) => {
                if let Ok(existing_pid) = content.trim().parse::<u32>() {
                    if is_process_running(existing_pid) {
                        eprintln!("machmond is already running (PID: {})", existing_pid);
                        std::process::exit(1);
                    } else {
                        info!(
                            "Removing stale PID file (process {} no longer exists)",
                            existing_pid
                        );
                        let _ = std::fs::remove_file(pid_file);
                    }
                }
            }
            Err(_) => {
                info!("Removing unreadable PID file");
                let _ = std::fs::remove_file(pid_file);
            }
        }
    }

    let current_pid = std::process::id();
    std::fs::write(pid_file, current_pid.to_string()).unwrap_or_else(|e| {
        eprintln!("Failed to write PID file: {}", e);
        std::process::exit(1);
    });
}

fn verify_pid_file(pid_file: &PathBuf) {
    let current_pid = std::process::id();
    let content = std::fs::read_to_string(pid_file).unwrap_or_else(|e| {
        eprintln!("Failed to read PID file for verification: {}", e);
        std::process::exit(1);
    });

    let file_pid: u32 = content.trim().parse().unwrap_or_else(|_| {
        eprintln!("PID file contains invalid PID format: {}", content);
        std::process::exit(1);
    });

    if file_pid != current_pid {
        eprintln!(
            "PID file verification failed: expected {}, found {}",
            current_pid, file_pid
        );
        std::process::exit(1);
    }

    info!("PID file verification successful (PID: {})", current_pid);
}

fn cleanup_pid_file(pid_file: &PathBuf) {
    if !pid_file.exists() {
        error!(
            "PID file disappeared during runtime! This indicates a problem with process management."
        );
        return;
    }

    let current_pid = std::process::id();
    match std::fs::read_to_string(pid_file) {
        Ok(content) => match content.trim().parse::<u32>() {
            Ok(file_pid) => {
                if file_pid == current_pid {
                    if let Err(e) = std::fs::remove_file(pid_file) {
                        error!("Failed to remove PID file: {}", e);
                    } else {
                        info!("Successfully cleaned up PID file");
                    }
                } else {
                    error!(
                        "PID file contains different PID ({}) than current process ({}). Not removing PID file!",
                        file_pid, current_pid
                    );
                }
            }
            Err(e) => {
                error!("PID file contains invalid PID: {}. Error: {}", content, e);
            }
        },
        Err(e) => {
            error!("Failed to read PID file for cleanup: {}", e);
        }
    }
}

fn setup_file_logging(log_dir: &Path, default_filter: &str) {
    std::fs::create_dir_all(log_dir).unwrap_or_else(|e| {
        eprintln!("Failed to create log directory: {}", e);
        std::process::exit(1);
    });

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("machmond")
        .filename_suffix("log")
        .max_log_files(7)
        .build(log_dir)
        .unwrap_or_else(|e| {
            eprintln!("Failed to create log appender: {}", e);
            std::process::exit(1);
        });

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .with_timer(fmt::time::ChronoUtc::new(
                    "%Y-%m-%dT%H:%M:%S%.6fZ".to_string(),
                )),
        )
        .with(env_filter)
        .init();
}

fn load_app_config() -> AppConfig {
    match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    let config = load_app_config();
    ensure_workspace_dir(&config.workspace_dir);

    let log_dir = paths::log_dir(&config.workspace_dir);
    setup_file_logging(&log_dir, &config.log_filter);
    set_run_id(new_run_id());

    let pid_file = paths::pid_file(&config.workspace_dir);
    write_pid_file(&pid_file);
    verify_pid_file(&pid_file);

    info!("Starting machmon daemon (machmond)");

    let store: Arc<dyn MachineStore> = match SqliteStore::open(
        paths::db_file(&config.workspace_dir),
        config.shift_seconds,
    ) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open machine store: {:#}", e);
            cleanup_pid_file(&pid_file);
            std::process::exit(1);
        }
    };

    let calendar = match ShiftCalendar::from_config(&config.shift) {
        Ok(calendar) => calendar,
        Err(e) => {
            error!("Invalid shift configuration: {:#}", e);
            cleanup_pid_file(&pid_file);
            std::process::exit(1);
        }
    };

    let bus = Arc::new(SnapshotBus::new());
    let sensor = build_sensor(&config.sensor);
    let registry = ThreadRegistry::new();

    let pipeline_config = PipelineConfig {
        stop_threshold_secs: config.stop_threshold_secs,
        sample_interval_ms: config.sample_interval_ms,
        idle_interval_ms: config.idle_interval_ms,
        commit_retries: config.commit_retries,
        confirm_frames: config.sensor.confirm_frames,
        min_confidence: config.sensor.min_confidence,
        shift_seconds: config.shift_seconds,
    };
    let resources = PipelineResources {
        store: Arc::clone(&store),
        sensor,
        calendar,
        bus: Arc::clone(&bus),
    };
    let pipeline = match Pipeline::new(pipeline_config, resources, Utc::now()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Failed to build pipeline: {:#}", e);
            cleanup_pid_file(&pid_file);
            std::process::exit(1);
        }
    };
    let pipeline_handle = match spawn_pipeline(pipeline, &registry) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start pipeline thread: {:#}", e);
            cleanup_pid_file(&pid_file);
            std::process::exit(1);
        }
    };

    let (http_stop_tx, http_stop_rx) = tokio::sync::watch::channel(false);
    let api_state = ApiState {
        bus: Arc::clone(&bus),
        store: Arc::clone(&store),
        tracker: DowntimeTracker::new(Arc::clone(&store)),
        shift_seconds: config.shift_seconds,
    };
    let http_handle = match spawn_http_server(
        config.http_listen.clone(),
        api_state,
        &registry,
        http_stop_rx,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start HTTP server: {:#}", e);
            let _ = pipeline_handle.shutdown_and_join();
            cleanup_pid_file(&pid_file);
            std::process::exit(1);
        }
    };

    let (term_tx, term_rx) = crossbeam_channel::bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = term_tx.try_send(());
    }) {
        error!("Failed to install signal handler: {}", e);
        let _ = http_stop_tx.send(true);
        let _ = pipeline_handle.shutdown_and_join();
        let _ = http_handle.join();
        cleanup_pid_file(&pid_file);
        std::process::exit(1);
    }

    info!(
        "machmond ready: api on {}, sampling every {}ms",
        config.http_listen, config.sample_interval_ms
    );

    // Park until SIGINT/SIGTERM, then tear the threads down in order.
    let _ = term_rx.recv();
    info!("Shutdown signal received");

    let _ = http_stop_tx.send(true);
    if let Err(e) = pipeline_handle.shutdown_and_join() {
        error!("Pipeline thread panicked: {:?}", e);
    }
    if let Err(e) = http_handle.join() {
        error!("HTTP server thread panicked: {:?}", e);
    }

    cleanup_pid_file(&pid_file);
    info!("machmond stopped");
}
