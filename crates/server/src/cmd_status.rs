//! `panedock status` - is the daemon running, and is it answering?

use crate::paths::Paths;
use crate::VERSION;

pub fn run(paths: &Paths, bind: &str) -> anyhow::Result<()> {
    println!();
    println!("  PaneDock v{}", VERSION);
    println!("  Data dir: {}", paths.data_dir().display());

    let pid_path = paths.pid_file_path();
    let pid_alive = match read_pid(&pid_path) {
        Some(pid) if process_alive(pid) => {
            println!("  PID: {} (running)", pid);
            true
        }
        Some(pid) => {
            println!("  PID file: {} (stale, process not found)", pid);
            false
        }
        None => {
            println!("  PID file: not found");
            false
        }
    };

    let socket = paths.socket_path();
    println!(
        "  Hook socket: {} ({})",
        socket.display(),
        if socket.exists() { "present" } else { "missing" }
    );

    let health_url = format!("http://{}/health", bind);
    let health_ok = check_health(&health_url);
    if health_ok {
        println!("  Health: OK ({})", health_url);
    } else if pid_alive {
        println!("  Health: unreachable (daemon may be bound to a different address)");
    } else {
        println!("  Health: unreachable");
    }

    println!();
    if !pid_alive && !health_ok {
        println!("  PaneDock is not running.");
        println!("  Start with: panedock start");
        println!();
    }
    Ok(())
}

fn read_pid(path: &std::path::Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|pid| *pid > 0)
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // kill -0 checks if process exists without sending a signal
    unsafe { libc::kill(pid, 0) == 0 }
}

fn check_health(url: &str) -> bool {
    // blocking check; runs before any daemon work
    std::process::Command::new("curl")
        .args(["-s", "--fail", "--connect-timeout", "1", "--max-time", "2", url])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
