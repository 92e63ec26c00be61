//! Command implementations for Pilum CLI.

use std::sync::Arc;
use std::time::Instant;

use chrono::{TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::MemSegmentConfig;
use crate::error::{PilumError, Result};
use crate::flusher::{FlushOutcome, Flusher};
use crate::mem_table::MemTable;
use crate::meta::{CollectionId, FieldSchema, LocalSnapshotStore, PartitionId, SnapshotStore};
use crate::segment::{FlushReport, SegmentReader, VectorBatch};
use crate::storage::file::{FileStorage, FileStorageConfig};
use crate::storage::{Storage, StorageConfig, StorageFactory};

const DEFAULT_PARTITION: &str = "_default";

/// Rows handed to the memory table per insert call.
const INSERT_CHUNK: usize = 1024;

/// Execute a CLI command.
pub fn execute_command(args: PilumArgs) -> Result<()> {
    match &args.command {
        Command::Ingest(ingest_args) => ingest(ingest_args.clone(), &args),
        Command::Inspect(inspect_args) => inspect(inspect_args.clone(), &args),
        Command::Manifest(manifest_args) => show_manifest(manifest_args.clone(), &args),
    }
}

fn open_storage(args_dir: &std::path::Path) -> Result<Arc<dyn Storage>> {
    StorageFactory::create(StorageConfig::File(FileStorageConfig::new(args_dir)))
}

/// Generate vectors, buffer them through a memory table and flush.
fn ingest(args: IngestArgs, cli_args: &PilumArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => MemSegmentConfig::from_json_file(path)?,
        None => MemSegmentConfig::default(),
    };
    if let Some(budget) = args.budget {
        config.max_segment_bytes = budget;
    }
    config.validate()?;
    if args.dimension == 0 {
        return Err(PilumError::invalid_config("dimension must be greater than zero"));
    }

    if cli_args.verbosity() > 1 {
        println!(
            "Ingesting {} vectors of dimension {} into {}",
            args.count,
            args.dimension,
            args.data_dir.display()
        );
    }

    let storage = open_storage(&args.data_dir)?;
    let store = Arc::new(LocalSnapshotStore::open(Arc::clone(&storage))?);
    let (collection_id, partition_id) = ensure_target(&store, &args, &config)?;
    let first_id = store
        .get_snapshot(collection_id)?
        .partition_row_count(partition_id)
        + 1;

    let start_time = Instant::now();
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::seed_from_u64(rand::random()),
    };
    let ids: Vec<u64> = (first_id..first_id + args.count as u64).collect();
    let data: Vec<f32> = (0..args.count * args.dimension)
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();

    let mut table = MemTable::new(
        collection_id,
        partition_id,
        config,
        store.clone(),
        Arc::clone(&storage),
    )?;

    let flusher = if args.background {
        Some(Flusher::start()?)
    } else {
        None
    };

    let delete_every = args.delete_every.filter(|n| *n > 0);
    let mut rows_inserted = 0;
    let mut rows_deleted = 0;
    for (chunk, (chunk_ids, chunk_data)) in ids
        .chunks(INSERT_CHUNK)
        .zip(data.chunks(INSERT_CHUNK * args.dimension))
        .enumerate()
    {
        let mut batch = VectorBatch::new(chunk_ids.to_vec(), chunk_data.to_vec());
        rows_inserted += table.insert(&mut batch)?;

        // Deletes must reach full segments before they leave the table.
        if let Some(n) = delete_every {
            let offset = chunk * INSERT_CHUNK;
            let doomed: Vec<u64> = chunk_ids
                .iter()
                .enumerate()
                .filter(|(i, _)| (offset + i) % n == 0)
                .map(|(_, id)| *id)
                .collect();
            rows_deleted += table.delete_batch(&doomed)?;
        }
        if let Some(flusher) = &flusher {
            for segment in table.take_immutable() {
                flusher.submit(segment, args.lsn)?;
            }
        }
    }

    let mut segments = Vec::new();
    if let Some(flusher) = flusher {
        for outcome in flusher.shutdown()? {
            segments.push(flushed_or_error(outcome)?);
        }
    }
    segments.extend(table.flush(args.lsn)?);
    segments.sort_by_key(|report| report.segment_id);

    let duration = start_time.elapsed();
    output_result(
        "Ingest finished",
        &IngestResult {
            collection_id,
            partition_id,
            rows_inserted,
            rows_deleted,
            segments_flushed: segments.len(),
            bytes_written: segments.iter().map(|report| report.file_size).sum(),
            duration_ms: duration.as_millis() as u64,
            segments,
        },
        cli_args,
    )
}

fn flushed_or_error(outcome: FlushOutcome) -> Result<FlushReport> {
    match outcome {
        FlushOutcome::Flushed(report) => Ok(report),
        FlushOutcome::Failed { segment, error } => {
            log::error!(
                "Background flush of segment {} failed: {error}",
                segment.segment_id()
            );
            Err(error)
        }
    }
}

/// Find the collection by name, creating it and its default partition if needed.
fn ensure_target(
    store: &LocalSnapshotStore,
    args: &IngestArgs,
    config: &MemSegmentConfig,
) -> Result<(CollectionId, PartitionId)> {
    for collection_id in store.collection_ids() {
        let snapshot = store.get_snapshot(collection_id)?;
        if snapshot.name != args.collection {
            continue;
        }
        let partition_id = match snapshot
            .partitions
            .values()
            .find(|partition| partition.name == DEFAULT_PARTITION)
        {
            Some(partition) => partition.id,
            None => store.create_partition(collection_id, DEFAULT_PARTITION)?,
        };
        return Ok((collection_id, partition_id));
    }

    let collection_id = store.create_collection(
        args.collection.clone(),
        vec![FieldSchema::vector(
            config.vector_field.clone(),
            args.dimension as i64,
        )],
    )?;
    let partition_id = store.create_partition(collection_id, DEFAULT_PARTITION)?;
    log::info!(
        "Created collection {} ({collection_id}) with dimension {}",
        args.collection,
        args.dimension
    );
    Ok((collection_id, partition_id))
}

/// Read a segment file and print its header and leading rows.
fn inspect(args: InspectArgs, cli_args: &PilumArgs) -> Result<()> {
    let storage = FileStorage::new(FileStorageConfig::new(&args.data_dir))?;
    let data = SegmentReader::open(&storage, &args.file)?;
    let file_size = storage.file_size(&args.file)?;

    let created_at = Utc
        .timestamp_millis_opt(data.header.created_at)
        .single()
        .map(|time| time.to_rfc3339())
        .unwrap_or_else(|| data.header.created_at.to_string());

    let rows = data
        .rows
        .iter()
        .take(args.rows)
        .map(|(id, vector)| RowSummary {
            id: *id,
            head: vector.data.iter().take(4).copied().collect(),
            attributes: vector.metadata.len(),
        })
        .collect();

    output_result(
        &format!("Segment file {}", args.file),
        &SegmentInspection {
            file_name: args.file.clone(),
            file_size,
            segment_id: data.header.segment_id,
            dimension: data.header.dimension,
            row_count: data.header.row_count,
            created_at,
            rows,
        },
        cli_args,
    )
}

/// Print the snapshot manifest of a data directory.
fn show_manifest(args: ManifestArgs, cli_args: &PilumArgs) -> Result<()> {
    let storage = open_storage(&args.data_dir)?;
    let store = LocalSnapshotStore::open(storage)?;

    let snapshots = store
        .collection_ids()
        .into_iter()
        .map(|id| store.get_snapshot(id))
        .collect::<Result<Vec<_>>>()?;

    if args.full {
        let full: Vec<_> = snapshots.iter().map(|snapshot| snapshot.as_ref()).collect();
        return output_result("Manifest", &full, cli_args);
    }

    let summaries: Vec<CollectionSummary> = snapshots
        .iter()
        .map(|snapshot| CollectionSummary {
            collection_id: snapshot.collection_id,
            name: snapshot.name.clone(),
            version: snapshot.version,
            partitions: snapshot.partitions.len(),
            segments: snapshot.segments.len(),
            segment_files: snapshot.segment_files.len(),
            rows: snapshot.segment_files.values().map(|file| file.row_count).sum(),
            size: snapshot.segment_files.values().map(|file| file.size).sum(),
        })
        .collect();

    if summaries.is_empty() && cli_args.verbosity() > 0 {
        println!("No collections in {}", args.data_dir.display());
        return Ok(());
    }
    output_result("Manifest", &summaries, cli_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn published_rows(dir: &TempDir) -> u64 {
        let storage = open_storage(dir.path()).unwrap();
        let store = LocalSnapshotStore::open(storage).unwrap();
        let collection_id = store.collection_ids()[0];
        let snapshot = store.get_snapshot(collection_id).unwrap();
        snapshot
            .segment_files
            .values()
            .map(|file| file.row_count)
            .sum()
    }

    #[test]
    fn test_background_ingest_applies_deletes_before_flushing() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        // 16 bytes per row, 4 rows per segment: every segment fills and is
        // handed to the background flusher
        let args = PilumArgs::parse_from([
            "pilum",
            "-q",
            "ingest",
            data_dir.as_str(),
            "-d",
            "4",
            "-n",
            "100",
            "-b",
            "64",
            "--delete-every",
            "10",
            "--seed",
            "7",
            "--background",
        ]);

        execute_command(args).unwrap();
        assert_eq!(published_rows(&dir), 90);
    }

    #[test]
    fn test_ingest_without_background() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        let args = PilumArgs::parse_from([
            "pilum",
            "-q",
            "ingest",
            data_dir.as_str(),
            "-d",
            "4",
            "-n",
            "30",
            "-b",
            "64",
            "--delete-every",
            "3",
        ]);

        execute_command(args).unwrap();
        assert_eq!(published_rows(&dir), 20);
    }
}
