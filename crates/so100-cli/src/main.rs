//! `so100` – SO100 demo launcher.
//!
//! 1. Loads `~/.so100/config.toml`, `SO100_*` environment overrides and
//!    command-line flags.
//! 2. Builds the robot session (mock or hardware), the search/grasp skills
//!    and the chat backend.
//! 3. Serves the cockpit until **Ctrl-C**, then cancels every task and
//!    disconnects the robot.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use so100_cockpit::CockpitServer;
use so100_hal::{MockRobot, MockRobotConfig, RobotSession, So100Robot, So100RobotConfig};
use so100_middleware::ConnectionBroadcaster;
use so100_runtime::{
    ColorDetector, ControllerConfig, Policy, ScanPolicy, ScriptedGraspPolicy, SearchUnavailable, Session, SkillSpec,
    Skills, build_chat, init_tracing, resolve_policy,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "so100", about = "SO100 arm demo: camera stream, search-and-grasp and chat over WebSocket", version)]
struct Cli {
    /// Config file (default: ~/.so100/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the synthetic robot instead of hardware
    #[arg(long)]
    mock: bool,

    /// Image the mock robot shows instead of its synthetic scene
    #[arg(long)]
    mock_image: Option<PathBuf>,

    /// Cockpit HTTP/WebSocket port
    #[arg(short, long)]
    port: Option<u16>,

    /// Serial device of the servo bus
    #[arg(long)]
    robot_port: Option<String>,

    /// Streaming rate in frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Search policy location (http(s):// endpoint)
    #[arg(long)]
    search_policy: Option<String>,

    /// Grasp policy location (http(s):// endpoint)
    #[arg(long)]
    grasp_policy: Option<String>,

    /// What to do when no search policy is available: pass_through or abort
    #[arg(long)]
    on_search_unavailable: Option<SearchUnavailable>,

    /// Write the effective configuration to the config file and exit
    #[arg(long)]
    write_config: bool,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(config::config_path)
    }

    /// Flags win over file and environment.
    fn apply(&self, cfg: &mut Config) {
        if self.mock {
            cfg.use_mock = true;
        }
        if let Some(path) = &self.mock_image {
            cfg.mock_static_image = Some(path.clone());
        }
        if let Some(port) = self.port {
            cfg.cockpit_port = port;
        }
        if let Some(robot_port) = &self.robot_port {
            cfg.robot_port = robot_port.clone();
        }
        if let Some(fps) = self.fps {
            cfg.demo_fps = fps;
        }
        if let Some(location) = &self.search_policy {
            cfg.search_policy = Some(location.clone());
        }
        if let Some(location) = &self.grasp_policy {
            cfg.grasp_policy = Some(location.clone());
        }
        if let Some(knob) = self.on_search_unavailable {
            cfg.on_search_unavailable = knob;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Before the runtime exists: the OTLP exporter is a simple one.
    let _telemetry = init_tracing("so100");

    print_banner();

    let path = cli.config_path();
    let mut cfg = match config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    cli.apply(&mut cfg);

    if cli.write_config {
        return match config::save_to(&cfg, &path) {
            Ok(()) => {
                println!("  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
                ExitCode::SUCCESS
            }
            Err(e) => {
                println!("{}: {}", "Error saving config".red(), e);
                ExitCode::FAILURE
            }
        };
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        on_signal.cancel();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; stop the process another way");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg, shutdown)) {
        Ok(()) => {
            println!("{}", "  ✓ Robot released. Bye.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}: {}", "Error".red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config, shutdown: CancellationToken) -> Result<(), String> {
    let robot = build_robot(&cfg);
    let skills = build_skills(&cfg);
    let chat = build_chat(&cfg.llm);

    println!(
        "  Robot: {}   Search: {}   Grasp: {}   Chat: {}",
        robot.kind().bold(),
        skills.search.policy_name().unwrap_or("none").bold(),
        skills.grasp.policy_name().unwrap_or("none").bold(),
        chat.name().bold(),
    );

    let session = Arc::new(Session::new(
        robot,
        ConnectionBroadcaster::default(),
        skills,
        chat,
        ControllerConfig {
            demo_fps: cfg.demo_fps,
            on_search_unavailable: cfg.on_search_unavailable,
        },
    ));
    let server = CockpitServer::new(Arc::clone(&session)).with_port(cfg.cockpit_port);
    println!(
        "  Cockpit on {}  (Ctrl-C to stop)\n",
        format!("http://localhost:{}", server.port()).cyan().bold()
    );

    let result = tokio::select! {
        served = server.run() => served.map_err(|e| e.to_string()),
        _ = shutdown.cancelled() => Ok(()),
    };

    session.shutdown().await;
    result
}

fn build_robot(cfg: &Config) -> Arc<dyn RobotSession> {
    if cfg.use_mock {
        info!(static_image = ?cfg.mock_static_image, "using mock robot");
        return Arc::new(MockRobot::new(MockRobotConfig {
            static_image: cfg.mock_static_image.clone(),
            ..MockRobotConfig::default()
        }));
    }
    let robot_cfg = So100RobotConfig {
        port: cfg.robot_port.clone(),
        baud_rate: cfg.baud_rate,
        camera_index: cfg.camera_index,
        width: cfg.camera_width,
        height: cfg.camera_height,
        io_timeout: Duration::from_millis(cfg.io_timeout_ms),
        ..So100RobotConfig::default()
    };
    info!(port = %robot_cfg.port, camera = robot_cfg.camera_index, "using SO100 hardware");
    Arc::new(So100Robot::new(robot_cfg))
}

/// Mock mode falls back to the built-in scan/grasp policies; hardware runs
/// only what is configured.
fn build_skills(cfg: &Config) -> Skills {
    let timeout = Duration::from_millis(cfg.policy_timeout_ms);
    let (search_fallback, grasp_fallback): (Option<Arc<dyn Policy>>, Option<Arc<dyn Policy>>) = if cfg.use_mock {
        (
            Some(Arc::new(ScanPolicy::default())),
            Some(Arc::new(ScriptedGraspPolicy::default())),
        )
    } else {
        (None, None)
    };

    let search = SkillSpec::new("search")
        .with_optional_policy(resolve_policy("search", cfg.search_policy.as_deref(), timeout, search_fallback))
        .with_max_steps(cfg.search_max_steps)
        .with_step_hz(cfg.search_step_hz);
    let grasp = SkillSpec::new("grasp")
        .with_optional_policy(resolve_policy("grasp", cfg.grasp_policy.as_deref(), timeout, grasp_fallback))
        .with_max_steps(cfg.grasp_max_steps)
        .with_step_hz(cfg.grasp_step_hz);

    Skills {
        search,
        grasp,
        detector: Arc::new(ColorDetector::default()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____ ____  _  ___   ___ "#.bold().cyan());
    println!("{}", r#"  / __// __ \/ |/ _ \ / _ \"#.bold().cyan());
    println!("{}", r#" _\ \ / /_/ // // // // // /"#.bold().cyan());
    println!("{}", r#"/___/ \____//_/ \___/ \___/ "#.bold().cyan());
    println!();
    println!("  {} {}", "SO100".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Robot arm demo: stream, search and grasp");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "so100",
            "--mock",
            "--mock-image",
            "/srv/table.png",
            "--port",
            "9001",
            "--fps",
            "30",
            "--search-policy",
            "http://gpu:9000/search",
            "--on-search-unavailable",
            "abort",
        ]);
        let mut cfg = Config::default();
        cli.apply(&mut cfg);

        assert!(cfg.use_mock);
        assert_eq!(cfg.mock_static_image, Some(PathBuf::from("/srv/table.png")));
        assert_eq!(cfg.cockpit_port, 9001);
        assert_eq!(cfg.demo_fps, 30);
        assert_eq!(cfg.search_policy.as_deref(), Some("http://gpu:9000/search"));
        assert_eq!(cfg.on_search_unavailable, SearchUnavailable::Abort);
    }

    #[test]
    fn absent_flags_leave_config_alone() {
        let cli = Cli::parse_from(["so100"]);
        let mut cfg = Config {
            cockpit_port: 8123,
            use_mock: true,
            ..Config::default()
        };
        cli.apply(&mut cfg);
        assert_eq!(cfg.cockpit_port, 8123);
        assert!(cfg.use_mock);
    }

    #[test]
    fn mock_mode_gets_builtin_policies() {
        let cfg = Config {
            use_mock: true,
            ..Config::default()
        };
        let skills = build_skills(&cfg);
        assert_eq!(skills.search.policy_name(), Some("scan"));
        assert_eq!(skills.grasp.policy_name(), Some("scripted_grasp"));
        assert_eq!(skills.search.max_steps(), 50);
        assert_eq!(skills.search.step_period(), Duration::from_millis(200));
    }

    #[test]
    fn hardware_mode_without_locations_has_no_policies() {
        let skills = build_skills(&Config::default());
        assert!(!skills.search.is_available());
        assert!(!skills.grasp.is_available());
    }

    #[test]
    fn mock_flag_selects_mock_robot() {
        let cfg = Config {
            use_mock: true,
            ..Config::default()
        };
        assert_eq!(build_robot(&cfg).kind(), "mock");
        assert_eq!(build_robot(&Config::default()).kind(), "so100");
    }
}
