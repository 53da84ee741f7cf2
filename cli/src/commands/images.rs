//! `dockyard images` command.

use std::path::Path;

use clap::Args;
use dockyard_core::Result;
use dockyard_pipeline::StoredImage;

use crate::output;

const HEADERS: [&str; 5] = ["REPOSITORY", "TAG", "DIGEST", "SIZE", "CREATED"];

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Format output using placeholders: {{.Repository}}, {{.Tag}}, {{.Digest}},
    /// {{.Size}}, {{.Created}}, {{.Reference}}
    #[arg(long)]
    pub format: Option<String>,
}

pub async fn execute(args: ImagesArgs, config_path: &Path) -> Result<()> {
    let config = super::load_config_or_default(config_path)?;
    let store = super::open_image_store(&config)?;
    let images = store.list().await;

    if args.quiet {
        for image in &images {
            println!("{}", image.reference);
        }
        return Ok(());
    }

    let rows: Vec<ImageRow> = images.iter().map(ImageRow::from_stored).collect();

    if let Some(ref fmt) = args.format {
        for row in &rows {
            println!("{}", row.apply_format(fmt));
        }
        return Ok(());
    }

    let mut table = output::new_table(&HEADERS);
    for row in &rows {
        table.add_row([&row.repository, &row.tag, &row.digest, &row.size, &row.created]);
    }
    println!("{table}");
    Ok(())
}

/// Display fields for one stored image.
struct ImageRow {
    reference: String,
    repository: String,
    tag: String,
    digest: String,
    size: String,
    created: String,
}

impl ImageRow {
    fn from_stored(image: &StoredImage) -> Self {
        let (repository, tag) = match image.image_reference() {
            Ok(r) if r.is_local() => (r.repository, r.tag),
            Ok(r) => (format!("{}/{}", r.registry, r.repository), r.tag),
            Err(_) => (image.reference.clone(), "<none>".to_string()),
        };

        Self {
            reference: image.reference.clone(),
            repository,
            tag,
            digest: output::short_digest(&image.digest),
            size: output::format_bytes(image.size_bytes),
            created: output::format_ago(&image.created_at),
        }
    }

    /// Replace `{{.Field}}` placeholders.
    fn apply_format(&self, fmt: &str) -> String {
        fmt.replace("{{.Repository}}", &self.repository)
            .replace("{{.Tag}}", &self.tag)
            .replace("{{.Digest}}", &self.digest)
            .replace("{{.Size}}", &self.size)
            .replace("{{.Created}}", &self.created)
            .replace("{{.Reference}}", &self.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(reference: &str) -> StoredImage {
        StoredImage {
            reference: reference.to_string(),
            digest: format!("sha256:{}", "c".repeat(64)),
            size_bytes: 2048,
            created_at: chrono::Utc::now(),
            path: std::path::PathBuf::from("/tmp/x"),
        }
    }

    #[test]
    fn test_row_for_local_image() {
        let row = ImageRow::from_stored(&stored("web:v1"));
        assert_eq!(row.repository, "web");
        assert_eq!(row.tag, "v1");
        assert_eq!(row.digest, "sha256:cccccccccccc");
        assert_eq!(row.size, "2.0 KB");
    }

    #[test]
    fn test_row_for_registry_image() {
        let row = ImageRow::from_stored(&stored("localhost:5000/team/web:v2"));
        assert_eq!(row.repository, "localhost:5000/team/web");
        assert_eq!(row.tag, "v2");
    }

    #[test]
    fn test_apply_format() {
        let row = ImageRow::from_stored(&stored("web:v1"));
        assert_eq!(row.apply_format("{{.Repository}}:{{.Tag}} {{.Size}}"), "web:v1 2.0 KB");
        assert_eq!(row.apply_format("{{.Reference}}"), "web:v1");
    }
}
