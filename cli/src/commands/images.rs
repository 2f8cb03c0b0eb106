//! `strata images` command.

use clap::Args;
use strata_core::StrataConfig;
use strata_runtime::{ImageReference, StoredImage};

use crate::output;

const HEADERS: &[&str] = &["REPOSITORY", "TAG", "DIGEST", "SIZE", "SOURCE", "CREATED"];

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    args: ImagesArgs,
    config: &StrataConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store(config)?;
    let mut images = store.list().await;
    images.sort_by(|a, b| a.reference.cmp(&b.reference));

    if args.quiet {
        for image in &images {
            println!("{}", image.reference);
        }
        return Ok(());
    }

    let mut table = output::new_table(HEADERS);
    for image in &images {
        let row = ImageRow::from_stored(image);
        table.add_row([
            row.repository,
            row.tag,
            row.digest,
            row.size,
            row.source,
            row.created,
        ]);
    }

    println!("{table}");
    Ok(())
}

/// Pre-computed display fields for a single image row.
struct ImageRow {
    repository: String,
    tag: String,
    digest: String,
    size: String,
    source: String,
    created: String,
}

impl ImageRow {
    fn from_stored(image: &StoredImage) -> Self {
        let (repository, tag) = match ImageReference::parse(&image.reference) {
            Ok(r) => {
                let repository = r.name();
                (repository, r.tag.unwrap_or_else(|| "<none>".to_string()))
            }
            Err(_) => (image.reference.clone(), "<none>".to_string()),
        };

        Self {
            repository,
            tag,
            digest: output::short_digest(&image.digest),
            size: output::format_bytes(image.size_bytes),
            source: image.source.to_string(),
            created: output::format_ago(&image.created_at),
        }
    }
}
