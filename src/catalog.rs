use anyhow::{Context, Result};
use iceberg::io::{FileIO, FileIOBuilder};
use iceberg::memory::{MemoryCatalogBuilder, MEMORY_CATALOG_WAREHOUSE};
use iceberg::{Catalog, CatalogBuilder};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Build the warehouse catalog: a memory catalog over filesystem FileIO
/// rooted at the warehouse path. Table metadata JSON and Parquet data
/// files live side-by-side under `<warehouse>/<schema>/<table>/`.
///
/// The catalog itself is process-local; cross-process visibility goes
/// through each table's `version-hint.text` pointer (see `writer`/`reader`).
pub async fn build_catalog(warehouse: &Path) -> Result<Arc<dyn Catalog>> {
    std::fs::create_dir_all(warehouse)
        .with_context(|| format!("creating warehouse at {}", warehouse.display()))?;

    let mut props = HashMap::new();
    props.insert(
        MEMORY_CATALOG_WAREHOUSE.to_string(),
        warehouse.display().to_string(),
    );

    let catalog = MemoryCatalogBuilder::default()
        .load("bemidb", props)
        .await
        .context("building warehouse catalog")?;

    tracing::debug!(warehouse = %warehouse.display(), "created warehouse catalog");
    Ok(Arc::new(catalog))
}

/// Filesystem FileIO for read paths that bypass the catalog (static table
/// loads from a metadata pointer).
pub fn build_file_io() -> Result<FileIO> {
    FileIOBuilder::new_fs_io()
        .build()
        .context("building filesystem FileIO")
}
