//! Telescope field roster bootstrap.
//!
//! Each survey telescope observes a fixed sky tessellation; the field grids
//! ship as whitespace text files (`field_id ra dec` per row). At startup the
//! server loads `{data_dir}/tessellations/{telescope}.tess` for every
//! configured telescope and merges the resulting fields into the repository.
//! Telescopes without a file are skipped, so deployments that seed fields
//! another way keep working.

use std::fs;

use anyhow::Context;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::db::FieldRepository;
use crate::models::telescope::{fields_from_tessellation, parse_tessellation};
use crate::models::WORKING_ORDER;

/// Load tessellation files for every configured telescope and merge the
/// fields into the repository. Returns the total number of fields written.
///
/// A missing file is not an error; an unreadable or malformed one is.
pub async fn load_tessellations<R>(repo: &R, config: &AppConfig) -> anyhow::Result<usize>
where
    R: FieldRepository + ?Sized,
{
    let dir = config.data_dir.join("tessellations");
    let mut total = 0;
    for telescope in &config.telescopes {
        let path = dir.join(format!("{}.tess", telescope.name));
        if !path.exists() {
            debug!(telescope = %telescope.name, "no tessellation file");
            continue;
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read tessellation file {:?}", path))?;
        let rows = parse_tessellation(&text)
            .with_context(|| format!("Failed to parse tessellation file {:?}", path))?;
        let fields = fields_from_tessellation(telescope, &rows, WORKING_ORDER);
        let written = repo.merge_fields(&fields).await?;
        info!(telescope = %telescope.name, fields = written, "tessellation loaded");
        total += written;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LocalRepository;
    use tempfile::TempDir;

    fn config_in(tmp: &TempDir) -> AppConfig {
        AppConfig {
            data_dir: tmp.path().to_path_buf(),
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn loads_only_telescopes_with_files() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tessellations");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("Gattini.tess"),
            "# Gattini test grid\n1 26.0 5.5\n2 30.5 5.5\n3 35.0 5.5\n",
        )
        .unwrap();

        let repo = LocalRepository::new();
        let total = load_tessellations(&repo, &config_in(&tmp)).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(repo.fields_for("Gattini").await.unwrap().len(), 3);
        assert!(repo.fields_for("ZTF").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_directory_loads_nothing() {
        let tmp = TempDir::new().unwrap();
        let repo = LocalRepository::new();
        let total = load_tessellations(&repo, &config_in(&tmp)).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tessellations");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ZTF.tess"), "1 26.0\n").unwrap();

        let repo = LocalRepository::new();
        let err = load_tessellations(&repo, &config_in(&tmp))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ZTF.tess"));
    }

    #[tokio::test]
    async fn reload_replaces_rather_than_duplicates() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tessellations");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Gattini.tess"), "1 26.0 5.5\n2 30.5 5.5\n").unwrap();

        let repo = LocalRepository::new();
        load_tessellations(&repo, &config_in(&tmp)).await.unwrap();
        load_tessellations(&repo, &config_in(&tmp)).await.unwrap();
        assert_eq!(repo.fields_for("Gattini").await.unwrap().len(), 2);
    }
}
