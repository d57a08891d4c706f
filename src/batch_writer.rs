//! Batched Parquet output.
//!
//! [`BatchWriter`] buffers processed documents and writes one Parquet file
//! every `batch_size` documents, plus a final file for the remainder. Each
//! row is one chunk, carrying the repository and file metadata flattened
//! into columns. A document whose chunks all failed embedding still counts
//! toward the threshold but contributes no rows.
//!
//! Files are named `{prefix}_{run stamp}_{sequence}.parquet`. A flush writes
//! to a uniquely named hidden temporary file in the same directory, syncs
//! it, hard-links it to the first free sequence name, and syncs the
//! directory. A reader never sees a partial artifact, and writers sharing a
//! prefix never replace each other's files.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, Float32Builder, ListBuilder, StringBuilder, UInt32Builder, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::info;
use uuid::Uuid;

use git2vec_core::models::{Chunk, Document, RepoDescriptor};
use git2vec_core::{Error, Result};

/// One document waiting to be written, with its surviving chunks.
struct PendingDocument {
    repo: Arc<RepoDescriptor>,
    document: Document,
    chunks: Vec<Chunk>,
}

pub struct BatchWriter {
    dir: PathBuf,
    prefix: String,
    run_stamp: String,
    batch_size: usize,
    next_seq: u64,
    schema: SchemaRef,
    buffer: Vec<PendingDocument>,
    files: Vec<PathBuf>,
    documents_written: u64,
    rows_written: u64,
}

impl BatchWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, batch_size: usize) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            run_stamp: Utc::now().format("%Y%m%d%H%M%S").to_string(),
            batch_size: batch_size.max(1),
            next_seq: 0,
            schema: Arc::new(output_schema()),
            buffer: Vec::new(),
            files: Vec::new(),
            documents_written: 0,
            rows_written: 0,
        }
    }

    /// Buffer one repository's documents and their chunks, flushing each
    /// time the buffer reaches `batch_size` documents. Returns the files
    /// written by this call.
    pub fn add(
        &mut self,
        repo: &RepoDescriptor,
        documents: Vec<Document>,
        chunks: Vec<Chunk>,
    ) -> Result<Vec<PathBuf>> {
        let repo = Arc::new(repo.clone());
        let mut by_path: HashMap<String, Vec<Chunk>> = HashMap::new();
        for chunk in chunks {
            by_path.entry(chunk.path.clone()).or_default().push(chunk);
        }

        let mut written = Vec::new();
        for document in documents {
            let chunks = by_path.remove(&document.path).unwrap_or_default();
            self.buffer.push(PendingDocument {
                repo: Arc::clone(&repo),
                document,
                chunks,
            });
            if self.buffer.len() >= self.batch_size {
                if let Some(path) = self.flush()? {
                    written.push(path);
                }
            }
        }
        Ok(written)
    }

    /// Write the buffer to a new file. Returns `None` when nothing is buffered.
    pub fn flush(&mut self) -> Result<Option<PathBuf>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| flush_error(&self.dir, "create output directory", e))?;

        let batch = self.build_record_batch()?;
        let tmp = self.dir.join(format!(
            ".{}_{}.{}.tmp",
            self.prefix,
            self.run_stamp,
            Uuid::new_v4().simple()
        ));
        if let Err(e) = write_parquet(&tmp, &self.schema, &batch) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        let committed = self.commit(&tmp);
        let _ = std::fs::remove_file(&tmp);
        let target = committed?;
        sync_dir(&self.dir)?;

        let documents = self.buffer.len() as u64;
        let rows = batch.num_rows() as u64;
        info!(
            path = %target.display(),
            documents,
            rows,
            "batch written"
        );
        self.documents_written += documents;
        self.rows_written += rows;
        self.buffer.clear();
        self.next_seq += 1;
        self.files.push(target.clone());
        Ok(Some(target))
    }

    /// Flush whatever remains, even below the threshold.
    pub fn finish(&mut self) -> Result<Option<PathBuf>> {
        self.flush()
    }

    pub fn pending_documents(&self) -> usize {
        self.buffer.len()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn documents_written(&self) -> u64 {
        self.documents_written
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn target(&self, seq: u64) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{:04}.parquet",
            self.prefix, self.run_stamp, seq
        ))
    }

    /// Link `tmp` to the first unused `{prefix}_{stamp}_{seq}.parquet`
    /// name. Creating a hard link fails when the name exists, so another
    /// writer sharing the prefix can never be overwritten.
    fn commit(&mut self, tmp: &Path) -> Result<PathBuf> {
        loop {
            let target = self.target(self.next_seq);
            match std::fs::hard_link(tmp, &target) {
                Ok(()) => return Ok(target),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.next_seq += 1;
                }
                Err(e) => return Err(flush_error(&target, "commit", e)),
            }
        }
    }

    fn build_record_batch(&self) -> Result<RecordBatch> {
        let rows: usize = self.buffer.iter().map(|p| p.chunks.len()).sum();

        let mut repo_id = StringBuilder::with_capacity(rows, rows * 24);
        let mut repo_url = StringBuilder::with_capacity(rows, rows * 48);
        let mut branch = StringBuilder::with_capacity(rows, rows * 8);
        let mut language = StringBuilder::with_capacity(rows, rows * 8);
        let mut stars = UInt64Builder::with_capacity(rows);
        let mut repo_created_at = StringBuilder::with_capacity(rows, rows * 20);
        let mut path = StringBuilder::with_capacity(rows, rows * 32);
        let mut file_name = StringBuilder::with_capacity(rows, rows * 16);
        let mut file_type = StringBuilder::with_capacity(rows, rows * 4);
        let mut file_size = UInt64Builder::with_capacity(rows);
        let mut chunk_id = StringBuilder::with_capacity(rows, rows * 36);
        let mut chunk_index = UInt32Builder::with_capacity(rows);
        let mut content = StringBuilder::with_capacity(rows, rows * 256);
        let mut token_count = UInt64Builder::with_capacity(rows);
        let mut content_hash = StringBuilder::with_capacity(rows, rows * 64);
        let mut embedding = ListBuilder::new(Float32Builder::new());

        for pending in &self.buffer {
            let repo = &pending.repo;
            let meta = &pending.document.metadata;
            let created = repo.created_at.to_rfc3339();
            for chunk in &pending.chunks {
                repo_id.append_value(repo.id());
                repo_url.append_value(&repo.url);
                branch.append_value(&meta.branch);
                language.append_option(repo.language.as_deref());
                stars.append_value(repo.stars);
                repo_created_at.append_value(&created);
                path.append_value(&pending.document.path);
                file_name.append_value(&meta.file_name);
                file_type.append_value(&meta.file_type);
                file_size.append_value(meta.size);
                chunk_id.append_value(&chunk.id);
                chunk_index.append_value(chunk.index);
                content.append_value(&chunk.text);
                token_count.append_value(chunk.token_count as u64);
                content_hash.append_value(&chunk.content_hash);
                match &chunk.embedding {
                    Some(values) => {
                        embedding.values().append_slice(values);
                        embedding.append(true);
                    }
                    None => embedding.append_null(),
                }
            }
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(repo_id.finish()),
            Arc::new(repo_url.finish()),
            Arc::new(branch.finish()),
            Arc::new(language.finish()),
            Arc::new(stars.finish()),
            Arc::new(repo_created_at.finish()),
            Arc::new(path.finish()),
            Arc::new(file_name.finish()),
            Arc::new(file_type.finish()),
            Arc::new(file_size.finish()),
            Arc::new(chunk_id.finish()),
            Arc::new(chunk_index.finish()),
            Arc::new(content.finish()),
            Arc::new(token_count.finish()),
            Arc::new(content_hash.finish()),
            Arc::new(embedding.finish()),
        ];

        RecordBatch::try_new(Arc::clone(&self.schema), columns)
            .map_err(|e| Error::Flush(format!("build record batch: {}", e)))
    }
}

/// Column layout of every output file.
pub fn output_schema() -> Schema {
    Schema::new(vec![
        Field::new("repo_id", DataType::Utf8, false),
        Field::new("repo_url", DataType::Utf8, false),
        Field::new("branch", DataType::Utf8, false),
        Field::new("language", DataType::Utf8, true),
        Field::new("stars", DataType::UInt64, false),
        Field::new("repo_created_at", DataType::Utf8, false),
        Field::new("path", DataType::Utf8, false),
        Field::new("file_name", DataType::Utf8, false),
        Field::new("file_type", DataType::Utf8, false),
        Field::new("file_size", DataType::UInt64, false),
        Field::new("chunk_id", DataType::Utf8, false),
        Field::new("chunk_index", DataType::UInt32, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("token_count", DataType::UInt64, false),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new(
            "embedding",
            DataType::List(Arc::new(Field::new("item", DataType::Float32, true))),
            true,
        ),
    ])
}

fn write_parquet(path: &Path, schema: &SchemaRef, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path).map_err(|e| flush_error(path, "create", e))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, Arc::clone(schema), Some(props))
        .map_err(|e| Error::Flush(format!("{}: {}", path.display(), e)))?;
    writer
        .write(batch)
        .map_err(|e| Error::Flush(format!("{}: {}", path.display(), e)))?;
    let file = writer
        .into_inner()
        .map_err(|e| Error::Flush(format!("{}: {}", path.display(), e)))?;
    file.sync_all().map_err(|e| flush_error(path, "sync", e))
}

/// Persist the directory entry of a newly committed file.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| flush_error(dir, "sync directory", e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn flush_error(path: &Path, action: &str, err: std::io::Error) -> Error {
    Error::Flush(format!("{} {}: {}", action, path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, ListArray, StringArray};
    use git2vec_core::chunk::Chunker;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::TempDir;

    fn repo(full_name: &str) -> RepoDescriptor {
        RepoDescriptor {
            url: format!("https://github.com/{}", full_name),
            full_name: full_name.to_string(),
            branch: "main".to_string(),
            stars: 7,
            forks: 0,
            created_at: Utc::now(),
            updated_at: None,
            language: Some("Rust".to_string()),
            size_kb: 1,
        }
    }

    fn docs(repo: &str, n: usize) -> (Vec<Document>, Vec<Chunk>) {
        let chunker = Chunker::approximate(4, 0).unwrap();
        let documents: Vec<Document> = (0..n)
            .map(|i| {
                Document::new(repo, "main", &format!("f{}.rs", i), format!("fn f{}() {{}}", i))
                    .unwrap()
            })
            .collect();
        let chunks = documents
            .iter()
            .flat_map(|d| chunker.chunk_document(d))
            .collect();
        (documents, chunks)
    }

    fn read_batches(path: &Path) -> Vec<RecordBatch> {
        let file = File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .map(|b| b.unwrap())
            .collect()
    }

    fn distinct_documents(path: &Path) -> usize {
        let mut seen = std::collections::HashSet::new();
        for batch in read_batches(path) {
            let repos = batch
                .column_by_name("repo_id")
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .clone();
            let paths = batch
                .column_by_name("path")
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .clone();
            for i in 0..batch.num_rows() {
                seen.insert((repos.value(i).to_string(), paths.value(i).to_string()));
            }
        }
        seen.len()
    }

    #[test]
    fn test_flushes_every_batch_size_documents() {
        let tmp = TempDir::new().unwrap();
        let mut writer = BatchWriter::new(tmp.path(), "filedata", 3);

        let (d1, c1) = docs("a/one", 4);
        let (d2, c2) = docs("a/two", 3);
        assert_eq!(writer.add(&repo("a/one"), d1, c1).unwrap().len(), 1);
        assert_eq!(writer.pending_documents(), 1);
        assert_eq!(writer.add(&repo("a/two"), d2, c2).unwrap().len(), 1);
        assert_eq!(writer.pending_documents(), 1);
        assert!(writer.finish().unwrap().is_some());

        // M = 7, B = 3 → ⌈7/3⌉ = 3 files, the last holding 7 mod 3 = 1 document.
        let files = writer.files().to_vec();
        assert_eq!(files.len(), 3);
        assert_eq!(distinct_documents(&files[0]), 3);
        assert_eq!(distinct_documents(&files[1]), 3);
        assert_eq!(distinct_documents(&files[2]), 1);
        assert_eq!(writer.documents_written(), 7);
    }

    #[test]
    fn test_file_names_are_sequential_and_no_temp_left() {
        let tmp = TempDir::new().unwrap();
        let mut writer = BatchWriter::new(tmp.path(), "filedata", 1);
        let (d, c) = docs("a/b", 2);
        writer.add(&repo("a/b"), d, c).unwrap();

        let names: Vec<String> = writer
            .files()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("filedata_") && names[0].ends_with("_0000.parquet"));
        assert!(names[1].ends_with("_0001.parquet"));

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_existing_file_is_not_overwritten() {
        let tmp = TempDir::new().unwrap();
        let mut writer = BatchWriter::new(tmp.path(), "filedata", 10);
        let taken = tmp
            .path()
            .join(format!("filedata_{}_0000.parquet", writer.run_stamp));
        std::fs::write(&taken, b"keep me").unwrap();

        let (d, c) = docs("a/b", 1);
        writer.add(&repo("a/b"), d, c).unwrap();
        let written = writer.finish().unwrap().unwrap();
        assert!(written.to_string_lossy().ends_with("_0001.parquet"));
        assert_eq!(std::fs::read(&taken).unwrap(), b"keep me");
    }

    #[test]
    fn test_writers_sharing_a_prefix_never_collide() {
        let tmp = TempDir::new().unwrap();
        let stamp = "20240101000000".to_string();
        let handles: Vec<_> = (0..4)
            .map(|w| {
                let dir = tmp.path().to_path_buf();
                let stamp = stamp.clone();
                std::thread::spawn(move || {
                    let mut writer = BatchWriter::new(dir, "filedata", 1);
                    writer.run_stamp = stamp;
                    let name = format!("w{}/r", w);
                    for _ in 0..5 {
                        let (d, c) = docs(&name, 1);
                        writer.add(&repo(&name), d, c).unwrap();
                    }
                    writer.files().to_vec()
                })
            })
            .collect();
        let mut files: Vec<PathBuf> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        files.sort();
        files.dedup();
        assert_eq!(files.len(), 20);
        for file in &files {
            let rows: usize = read_batches(file).iter().map(|b| b.num_rows()).sum();
            assert!(rows >= 1);
        }
        let leftovers = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_rows_carry_metadata_and_embeddings() {
        let tmp = TempDir::new().unwrap();
        let mut writer = BatchWriter::new(tmp.path(), "out", 10);
        let (documents, mut chunks) = docs("a/b", 2);
        chunks[0].embedding = Some(vec![0.5, 0.25]);
        writer.add(&repo("a/b"), documents, chunks).unwrap();
        let path = writer.finish().unwrap().unwrap();

        let batches = read_batches(&path);
        let batch = &batches[0];
        let urls = batch
            .column_by_name("repo_url")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(urls.value(0), "https://github.com/a/b");
        let embeddings = batch
            .column_by_name("embedding")
            .unwrap()
            .as_any()
            .downcast_ref::<ListArray>()
            .unwrap();
        assert!(embeddings.is_valid(0));
        assert_eq!(embeddings.value(0).len(), 2);
        assert!(embeddings.is_null(batch.num_rows() - 1));
    }

    #[test]
    fn test_document_without_chunks_counts_but_adds_no_rows() {
        let tmp = TempDir::new().unwrap();
        let mut writer = BatchWriter::new(tmp.path(), "out", 2);
        let (documents, chunks) = docs("a/b", 2);
        let kept: Vec<Chunk> = chunks.into_iter().filter(|c| c.path == "f0.rs").collect();
        let expected_rows = kept.len() as u64;
        let written = writer.add(&repo("a/b"), documents, kept).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(writer.documents_written(), 2);
        assert_eq!(writer.rows_written(), expected_rows);
    }

    #[test]
    fn test_finish_with_empty_buffer_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut writer = BatchWriter::new(tmp.path().join("out"), "filedata", 5);
        assert!(writer.finish().unwrap().is_none());
        assert!(!tmp.path().join("out").exists());
    }

    #[test]
    fn test_unwritable_directory_is_flush_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let mut writer = BatchWriter::new(&blocker, "filedata", 1);
        let (d, c) = docs("a/b", 1);
        let err = writer.add(&repo("a/b"), d, c).unwrap_err();
        assert!(matches!(err, Error::Flush(_)));
    }
}
