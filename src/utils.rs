use std::{ env, path::PathBuf };

use chrono::{ DateTime, SecondsFormat, Utc };

const ID_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

fn get_dir(test_env: bool) -> Result<PathBuf, std::io::Error> {
    let dir = if test_env {
        env::current_dir()?
    } else {
        let mut d = env::current_exe()?;
        d.pop();
        d
    };
    Ok(dir)
}

pub fn config_dir(test_env: bool) -> Result<PathBuf, std::io::Error> {
    let mut dir = get_dir(test_env)?;
    dir.push("configs");
    Ok(dir)
}

pub fn state_dir(test_env: bool) -> Result<PathBuf, std::io::Error> {
    let mut dir = get_dir(test_env)?;
    dir.push("state");
    Ok(dir)
}

pub fn generate_id() -> String {
    nanoid::nanoid!(12, &ID_ALPHABET)
}

/// Millisecond precision, always with a literal `Z`. Cursors and incidents are
/// written this way so they sort lexically.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Joins a base URL and a path suffix with exactly one slash between them.
pub fn join_url(base: &str, suffix: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), suffix.trim_start_matches('/'))
}
