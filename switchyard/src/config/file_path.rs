use crate::config::FileError;
use std::path::{Component, Path, PathBuf};

/// Join `path` onto `root`, refusing anything that would leave `root`.
pub fn safe_join_path(root: &Path, path: &str) -> Result<PathBuf, FileError> {
    let mut joined = root.to_path_buf();
    let mut depth = 0usize;
    for comp in Path::new(path).components() {
        match comp {
            Component::Normal(c) => {
                joined.push(c);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(FileError::OutOfScope(path.to_string()));
                }
                joined.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(FileError::OutOfScope(path.to_string()))
            }
        }
    }
    Ok(joined)
}

pub fn parse_paths(
    config: &Option<PathBuf>,
    app_data: &Option<PathBuf>,
) -> Result<(PathBuf, PathBuf), FileError> {
    let config_path = match config {
        None => {
            let home = PathBuf::from(std::env::var("HOME")?);
            home.join(".config").join("switchyard")
        }
        Some(p) => p.clone(),
    };
    let data_path = match app_data {
        None => {
            let home = PathBuf::from(std::env::var("HOME")?);
            home.join(".local").join("share").join("switchyard")
        }
        Some(p) => p.clone(),
    };
    Ok((config_path, data_path))
}

#[test]
fn test_safe_join() {
    let root = Path::new("/etc/switchyard");
    assert_eq!(
        safe_join_path(root, "providers/./sub.yml").unwrap(),
        PathBuf::from("/etc/switchyard/providers/sub.yml")
    );
    assert_eq!(
        safe_join_path(root, "a/../b.yml").unwrap(),
        PathBuf::from("/etc/switchyard/b.yml")
    );
    assert!(safe_join_path(root, "../passwd").is_err());
    assert!(safe_join_path(root, "/etc/passwd").is_err());
}
