use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::error;
use machmon::util::config::{api_base_url, AppConfig};
use machmon::util::paths;
use std::path::{Path, PathBuf};
use std::process::{self, Command, Stdio};
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    Start,
    Stop,
    Restart,
    Status,
    State,
    Cycles {
        /// Day to list, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<String>,
    },
    Summary {
        /// Day to summarize, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<String>,
    },
    Downtime {
        #[command(subcommand)]
        action: DowntimeAction,
    },
    Export {
        #[arg(long)]
        report_type: String,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        month: Option<u32>,
        #[arg(long)]
        day: Option<u32>,
        /// Output path (default: the server-suggested filename)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum DowntimeAction {
    Start {
        /// Reason code, e.g. REPAIR or MATERIAL_SHORTAGE
        #[arg(long)]
        reason: String,
    },
    Stop,
    Active,
    Summary,
    History {
        #[arg(long)]
        start_date: Option<String>,
        #[arg(long)]
        end_date: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },
    Top,
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn read_pid_file(pid_file: &Path) -> Result<Option<u32>> {
    if !pid_file.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(pid_file).context("Failed to read PID file")?;
    let pid = content
        .trim()
        .parse::<u32>()
        .context("Invalid PID in file")?;
    Ok(Some(pid))
}

fn is_process_running(pid: u32) -> bool {
    Command::new("ps")
        .args(["-p", &pid.to_string()])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn spawn_machmond() -> Result<()> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()));
    let cmd = if let Some(dir) = exe_dir {
        dir.join("machmond")
    } else {
        PathBuf::from("machmond")
    };
    Command::new(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .context("Failed to spawn machmond")?;
    Ok(())
}

fn start_daemon(workspace_dir: &Path) -> Result<()> {
    let pid_file = paths::pid_file(workspace_dir);
    if let Some(existing_pid) = read_pid_file(&pid_file)? {
        if is_process_running(existing_pid) {
            return Err(anyhow::anyhow!(
                "machmond is already running (PID: {}). Use 'machmonctl stop' first.",
                existing_pid
            ));
        } else {
            let _ = std::fs::remove_file(&pid_file);
        }
    }
    println!("Starting machmond in background...");
    spawn_machmond()?;
    Ok(())
}

fn stop_daemon(workspace_dir: &Path) -> Result<()> {
    let pid_file = paths::pid_file(workspace_dir);
    match read_pid_file(&pid_file)? {
        Some(pid) if is_process_running(pid) => {
            println!("Stopping machmond (PID: {})...", pid);
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            for _ in 0..20 {
                std::thread::sleep(Duration::from_millis(250));
                if !is_process_running(pid) {
                    println!("machmond stopped");
                    let _ = std::fs::remove_file(&pid_file);
                    return Ok(());
                }
            }
            println!("machmond did not stop within 5s, you may need to kill it manually");
        }
        Some(_) => {
            println!("machmond is not running (stale PID file)");
            let _ = std::fs::remove_file(&pid_file);
        }
        None => println!("machmond is not running"),
    }
    Ok(())
}

fn restart_daemon(workspace_dir: &Path) -> Result<()> {
    println!("Restarting machmond...");
    stop_daemon(workspace_dir)?;
    start_daemon(workspace_dir)
}

fn get_status(config: &AppConfig) -> Result<()> {
    let pid_file = paths::pid_file(&config.workspace_dir);
    match read_pid_file(&pid_file)? {
        Some(pid) if is_process_running(pid) => {
            println!("machmond: running (PID: {})", pid);
        }
        Some(pid) => println!("machmond: not running (stale PID file for {})", pid),
        None => println!("machmond: not running"),
    }
    let base = api_base_url(&config.http_listen);
    match get_json(&base, "/api/state", &[]) {
        Ok(state) => {
            println!("API: reachable on {}", config.http_listen);
            print_json(&state)?;
        }
        Err(_) => println!("API: not reachable on {}", config.http_listen),
    }
    Ok(())
}

fn client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("build HTTP client")
}

fn get_json(base: &str, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value> {
    let url = format!("{base}{path}");
    let resp = client()?
        .get(&url)
        .query(query)
        .send()
        .with_context(|| format!("GET {url} (is machmond running?)"))?;
    decode_json(resp)
}

fn post_json(base: &str, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
    let url = format!("{base}{path}");
    let resp = client()?
        .post(&url)
        .json(&body)
        .send()
        .with_context(|| format!("POST {url} (is machmond running?)"))?;
    decode_json(resp)
}

fn decode_json(resp: reqwest::blocking::Response) -> Result<serde_json::Value> {
    let status = resp.status();
    let text = resp.text().context("read API response")?;
    if !status.is_success() {
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(text);
        return Err(anyhow::anyhow!("API error ({status}): {message}"));
    }
    serde_json::from_str(&text).context("parse API response")
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn date_query(date: Option<String>) -> Vec<(&'static str, String)> {
    date.map(|d| vec![("date", d)]).unwrap_or_default()
}

fn attachment_filename(resp: &reqwest::blocking::Response) -> Option<String> {
    let value = resp
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    let start = value.find("filename=\"")? + "filename=\"".len();
    let rest = &value[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn export_report(
    base: &str,
    report_type: String,
    year: Option<i32>,
    month: Option<u32>,
    day: Option<u32>,
    out: Option<PathBuf>,
) -> Result<()> {
    let mut query: Vec<(&str, String)> = vec![("report_type", report_type)];
    if let Some(year) = year {
        query.push(("year", year.to_string()));
    }
    if let Some(month) = month {
        query.push(("month", month.to_string()));
    }
    if let Some(day) = day {
        query.push(("day", day.to_string()));
    }

    let url = format!("{base}/api/downtime/export");
    let resp = client()?
        .get(&url)
        .query(&query)
        .send()
        .with_context(|| format!("GET {url} (is machmond running?)"))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(text);
        return Err(anyhow::anyhow!("API error ({status}): {message}"));
    }

    let path = match out {
        Some(path) => path,
        None => PathBuf::from(attachment_filename(&resp).unwrap_or_else(|| "report.zip".into())),
    };
    let bytes = resp.bytes().context("download report")?;
    std::fs::write(&path, &bytes).with_context(|| format!("write {}", path.display()))?;
    println!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    let base = api_base_url(&config.http_listen);

    let result = match cli.command {
        Commands::Start => start_daemon(&config.workspace_dir),
        Commands::Stop => stop_daemon(&config.workspace_dir),
        Commands::Restart => restart_daemon(&config.workspace_dir),
        Commands::Status => get_status(&config),
        Commands::State => get_json(&base, "/api/state", &[]).and_then(|v| print_json(&v)),
        Commands::Cycles { date } => {
            get_json(&base, "/api/cycles", &date_query(date)).and_then(|v| print_json(&v))
        }
        Commands::Summary { date } => match date {
            None => get_json(&base, "/api/summary/today", &[]).and_then(|v| print_json(&v)),
            Some(d) => {
                get_json(&base, "/api/summary", &[("date", d)]).and_then(|v| print_json(&v))
            }
        },
        Commands::Downtime { action } => match action {
            DowntimeAction::Start { reason } => {
                post_json(&base, "/api/downtime/start", serde_json::json!({ "reason": reason }))
                    .and_then(|v| print_json(&v))
            }
            DowntimeAction::Stop => {
                post_json(&base, "/api/downtime/stop", serde_json::json!({}))
                    .and_then(|v| print_json(&v))
            }
            DowntimeAction::Active => {
                get_json(&base, "/api/downtime/active", &[]).and_then(|v| print_json(&v))
            }
            DowntimeAction::Summary => {
                get_json(&base, "/api/downtime/summary/today", &[]).and_then(|v| print_json(&v))
            }
            DowntimeAction::History {
                start_date,
                end_date,
                limit,
            } => {
                let mut query = Vec::new();
                if let Some(start) = start_date {
                    query.push(("start_date", start));
                }
                if let Some(end) = end_date {
                    query.push(("end_date", end));
                }
                if let Some(limit) = limit {
                    query.push(("limit", limit.to_string()));
                }
                get_json(&base, "/api/downtime/history", &query).and_then(|v| print_json(&v))
            }
            DowntimeAction::Top => {
                get_json(&base, "/api/downtime/top-today", &[]).and_then(|v| print_json(&v))
            }
        },
        Commands::Export {
            report_type,
            year,
            month,
            day,
            out,
        } => export_report(&base, report_type, year, month, day, out),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        process::exit(1);
    }
}
