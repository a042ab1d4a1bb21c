use std::{
    env,
    fs::create_dir_all,
    io,
    path::{Path, PathBuf},
};

// Public Exports
pub use bincode;
pub use chrono;
pub use directories;
pub use log;
pub use reqwest;
pub use serde;
pub use serde_json;
pub use tokio;

use directories::ProjectDirs;

pub mod macros;
pub mod post;

/// Returns a `PathBuf` pointing to the harvester's state directory.
///
/// This is XDG-compliant and places state files in
/// `$XDG_CONFIG_HOME/imageboard-harvester` on Linux or the platform
/// equivalent elsewhere.
///
/// Or you can set the env var `IBH_STATE_DIR` to point it to a custom location.
pub fn state_dir() -> Result<PathBuf, io::Error> {
    let cfg_path = env::var("IBH_STATE_DIR").unwrap_or({
        let cdir = ProjectDirs::from("com", "imageboard-harvester", "imageboard-harvester")
            .expect("no home directory available");
        cdir.config_dir().to_string_lossy().to_string()
    });

    let cfold = Path::new(&cfg_path);

    if !cfold.exists() {
        create_dir_all(cfold)?;
    }

    Ok(cfold.to_path_buf())
}
