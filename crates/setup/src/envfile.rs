//! The application `.env` file consumed by the orchestration stack.

use std::path::Path;

use camino::Utf8Path;
use cap_std_ext::{cap_std, cap_std::fs::Dir, dirext::CapStdExtDirExt};
use indoc::formatdoc;
use rand::seq::IndexedRandom;
use rand::Rng;
use tracing::info;

use crate::config::ProvisionConfig;
use crate::errors::{ProvisionError, Result};

/// Characters of the web framework secret key.
pub const SECRET_KEY_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*(-_=+)";
pub const SECRET_KEY_LEN: usize = 50;

/// Characters of the database password.
pub const DB_PASSWORD_ALPHABET: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%&*-_=+";
pub const DB_PASSWORD_LEN: usize = 16;

/// `len` characters drawn uniformly from `alphabet`.
pub fn generate_secret<R: Rng + ?Sized>(rng: &mut R, alphabet: &str, len: usize) -> String {
    let chars: Vec<char> = alphabet.chars().collect();
    (0..len).filter_map(|_| chars.choose(rng).copied()).collect()
}

/// Values that vary between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvValues<'a> {
    pub dev: bool,
    pub secret_key: &'a str,
    pub db_password: &'a str,
    pub workers: i64,
    pub workers_dir: &'a Utf8Path,
}

pub fn render(v: &EnvValues<'_>) -> String {
    let debug = if v.dev { "True" } else { "False" };
    formatdoc! {"
        DEBUG={debug}
        SECRET_KEY='{secret_key}'

        POSTGRES_ENGINE=django.db.backends.postgresql
        POSTGRES_DB=postgres
        POSTGRES_USER=postgres
        POSTGRES_PASSWORD='{db_password}'
        POSTGRES_HOST=db
        POSTGRES_PORT=5432

        CELERY_TASKS_SCHEDULE=10.0

        NB_WIN7_WORKERS={workers}
        WIN7_IMAGES_DIR={workers_dir}
        ",
        secret_key = v.secret_key,
        db_password = v.db_password,
        workers = v.workers,
        workers_dir = v.workers_dir,
    }
}

/// Generate fresh secrets and atomically replace the environment file.
pub fn write_env_file(cfg: &ProvisionConfig) -> Result<()> {
    info!("Updating {} configuration file...", cfg.env_file);
    let mut rng = rand::rng();
    let secret_key = generate_secret(&mut rng, SECRET_KEY_ALPHABET, SECRET_KEY_LEN);
    let db_password = generate_secret(&mut rng, DB_PASSWORD_ALPHABET, DB_PASSWORD_LEN);
    let contents = render(&EnvValues {
        dev: cfg.dev,
        secret_key: &secret_key,
        db_password: &db_password,
        workers: cfg.workers,
        workers_dir: &cfg.workers_dir,
    });

    let path = cfg.env_file.as_std_path();
    let env_error = |source: std::io::Error| ProvisionError::EnvFile {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let filename = path.file_name().unwrap_or(path.as_os_str());
    let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority()).map_err(env_error)?;
    dir.atomic_write(filename, contents).map_err(env_error)?;
    Ok(())
}
