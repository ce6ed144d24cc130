use std::path::{Path, PathBuf};

/// If `certpilot-node` is being run from a path under a `target/` directory, return that
/// `target/` directory path.
pub fn target_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let mut cur = exe_path;
    loop {
        if cur.file_name().is_some_and(|n| n == "target") {
            return Some(cur.to_path_buf());
        }
        cur = cur.parent()?;
    }
}

/// Default data dir for debug builds when running from a source checkout.
///
/// Example: `{repo}/local-dev/certpilot-node/data`
pub fn debug_default_data_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    target_dir_from_exe(exe_path)?
        .parent()
        .map(|root| root.join("local-dev").join("certpilot-node").join("data"))
}

pub fn account_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("acme")
}

pub fn store_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("certs")
}
