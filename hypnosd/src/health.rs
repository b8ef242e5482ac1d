//! Health reporting for the unauthenticated `/health` endpoint.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::config::{self, AppConfig, Role};
use crate::exec::{self, CommandAvailability};

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub role: Role,
    pub uptime_seconds: u64,
    pub config: ConfigHealth,
    pub commands: BTreeMap<String, CommandAvailability>,
}

#[derive(Debug, Serialize)]
pub struct ConfigHealth {
    pub valid: bool,
    pub errors: Vec<String>,
}

fn program_name(command_line: &str) -> Option<String> {
    let argv = shell_words::split(command_line).ok()?;
    let program = argv.first()?;
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Build the health report: config validity plus availability of the
/// role's privileged executable.
pub async fn report(cfg: &AppConfig, role: Role, tracker: &HealthTracker) -> HealthReport {
    let errors = config::validate(cfg);

    let mut commands = BTreeMap::new();
    match role {
        Role::Sleeper => {
            if let Some(name) = program_name(&cfg.sleeper.systemctl_command) {
                commands.insert(name.clone(), exec::check_command_availability(&name).await);
            }
        }
        Role::Waker => match cfg.waker.wol_exec.as_deref() {
            Some(wol_exec) if !wol_exec.trim().is_empty() => {
                if let Some(name) = program_name(wol_exec) {
                    commands.insert(name.clone(), exec::check_command_availability(&name).await);
                }
            }
            _ => {
                // Native UDP broadcast needs no external tool.
                commands.insert(
                    "wol".to_string(),
                    CommandAvailability {
                        available: true,
                        path: Some("builtin udp broadcast".to_string()),
                        error: None,
                    },
                );
            }
        },
    }

    let config_valid = errors.is_empty();
    let commands_healthy = commands.values().all(|c| c.available);
    HealthReport {
        status: if config_valid && commands_healthy {
            "healthy"
        } else {
            "unhealthy"
        },
        role,
        uptime_seconds: tracker.uptime_seconds(),
        config: ConfigHealth { valid: config_valid, errors },
        commands,
    }
}
