use std::path::PathBuf;

pub const DEFAULT_HUB_PORT: u16 = 8765;

#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    format!("{}/playsync-mpv.sock", std::env::temp_dir().display())
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    "playsync-mpv".to_string()
}

#[cfg(unix)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_name())
}

#[cfg(windows)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name())
}

const APP_DIR: &str = "playsync";

/// `$HOME/<segments>/playsync`, falling back to `fallback` when there is no home.
#[cfg(unix)]
fn under_home(segments: &[&str], fallback: &str) -> PathBuf {
    let mut dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from(fallback));
    dir.extend(segments);
    dir.join(APP_DIR)
}

/// Logs, queue state. XDG-style on macOS as well.
pub fn data_dir() -> PathBuf {
    #[cfg(unix)]
    {
        under_home(&[".local", "share"], "/tmp")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        under_home(&[".config"], ".")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

/// Find the mpv binary.
///
/// Order: explicit override, beside the current executable, then PATH.
pub fn find_mpv_binary(override_path: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(p) = override_path {
        if p.exists() {
            return Some(p.clone());
        }
        tracing::warn!("configured mpv binary {:?} does not exist", p);
    }

    let exe_name = mpv_binary_name();

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let local_mpv = dir.join(exe_name);
            if local_mpv.exists() {
                return Some(local_mpv);
            }
        }
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(exe_name))
        .find(|p| p.exists())
}
