use crate::cache::Cache;
use crate::client::{ClientError, ObjectClient, RetryPolicy};
use crate::common::config::Options;
use crate::common::error::{Error, Result};
use crate::transfer::handle::{TransferDirection, TransferHandle, TransferStatus};
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Moves bytes between the cache and the object store. Single-part requests
/// below the configured thresholds, otherwise `transfer_buf_size` chunks
/// fanned out under the parallel-transfer semaphore. Every request is
/// wrapped by the retry policy.
pub struct TransferEngine {
    client: Arc<dyn ObjectClient>,
    cache: Arc<Cache>,
    retry: RetryPolicy,
    transfer_buf_size: u64,
    multipart_upload_threshold: u64,
    multipart_download_threshold: u64,
    semaphore: Arc<Semaphore>,
    // keyed by object key; aborted on shutdown so the remote does not
    // accumulate half-finished uploads
    unfinished: Mutex<HashMap<String, Arc<TransferHandle>>>,
}

impl TransferEngine {
    pub fn new(client: Arc<dyn ObjectClient>, cache: Arc<Cache>, options: &Options) -> Self {
        Self {
            client,
            cache,
            retry: RetryPolicy::new(options.max_retries, options.retry_scale_factor_ms),
            transfer_buf_size: options.transfer_buf_size.max(1),
            multipart_upload_threshold: options.multipart_upload_threshold,
            multipart_download_threshold: options.multipart_download_threshold,
            semaphore: Arc::new(Semaphore::new(options.max_parallel_transfers)),
            unfinished: Mutex::new(HashMap::new()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn unfinished_count(&self) -> usize {
        self.unfinished.lock().unwrap().len()
    }

    /// Fetch [offset, offset+len) of an object. Lengths at or under the
    /// download threshold go out as one ranged GET; larger requests are
    /// split into buffer-sized chunks issued concurrently.
    pub async fn download(
        &self,
        path: &str,
        offset: u64,
        len: u64,
    ) -> Result<(Arc<TransferHandle>, Bytes)> {
        let handle = Arc::new(TransferHandle::new(
            path,
            TransferDirection::Download,
            len,
        ));
        handle.update_status(TransferStatus::InProgress);

        if len == 0 {
            handle.update_status(TransferStatus::Completed);
            return Ok((handle, Bytes::new()));
        }

        if len <= self.multipart_download_threshold {
            handle.add_part(1, offset, len);
            handle.part_pending(1);
            let h = handle.clone();
            let outcome = self
                .retry
                .run("download", || h.is_cancelled(), || {
                    self.client.download_range(path, offset, len)
                })
                .await;
            return match outcome {
                Ok(data) => {
                    handle.part_completed(1, "");
                    handle.update_status(TransferStatus::Completed);
                    Ok((handle, data))
                }
                Err(e) => {
                    handle.part_failed(1);
                    handle.set_error(e.clone());
                    handle.update_status(TransferStatus::Failed);
                    Err(transfer_error(path, &handle, e))
                }
            };
        }

        handle.set_multipart(true);
        let mut tasks = Vec::new();
        for (number, (part_offset, part_len)) in cut_parts(offset, len, self.transfer_buf_size) {
            handle.add_part(number, part_offset, part_len);
            let client = self.client.clone();
            let semaphore = self.semaphore.clone();
            let retry = self.retry;
            let h = handle.clone();
            let path = path.to_string();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                if !h.should_continue() {
                    h.part_failed(number);
                    return Err(ClientError::Storage("transfer cancelled".to_string()));
                }
                h.part_pending(number);
                match retry
                    .run("download part", || h.is_cancelled(), || {
                        client.download_range(&path, part_offset, part_len)
                    })
                    .await
                {
                    Ok(data) => {
                        h.part_completed(number, "");
                        Ok((part_offset, data))
                    }
                    Err(e) => {
                        h.part_failed(number);
                        h.set_error(e.clone());
                        Err(e)
                    }
                }
            }));
        }

        let mut assembled = BytesMut::zeroed(len as usize);
        let mut first_error: Option<ClientError> = None;
        for joined in join_all(tasks).await {
            match joined {
                Ok(Ok((part_offset, data))) => {
                    let begin = (part_offset - offset) as usize;
                    assembled[begin..begin + data.len()].copy_from_slice(&data);
                }
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(ClientError::Storage(format!("task failed: {}", e)));
                    }
                }
            }
        }

        match first_error {
            None => {
                handle.update_status(TransferStatus::Completed);
                Ok((handle, assembled.freeze()))
            }
            Some(e) => {
                handle.update_status(TransferStatus::Failed);
                Err(transfer_error(path, &handle, e))
            }
        }
    }

    /// Push a file's cached content to the object store. The caller has
    /// already made the full body resident. Returns the handle with the
    /// final etag once the transfer completed.
    pub async fn upload(&self, path: &str, size: u64, mtime: i64) -> Result<Arc<TransferHandle>> {
        let handle = Arc::new(TransferHandle::new(path, TransferDirection::Upload, size));
        handle.update_status(TransferStatus::InProgress);

        if size <= self.multipart_upload_threshold {
            self.upload_single(&handle, path, size, mtime).await?;
        } else {
            self.upload_multipart(&handle, path, size, mtime).await?;
        }
        Ok(handle)
    }

    async fn upload_single(
        &self,
        handle: &Arc<TransferHandle>,
        path: &str,
        size: u64,
        mtime: i64,
    ) -> Result<()> {
        handle.add_part(1, 0, size);
        handle.part_pending(1);

        let mut buf = vec![0u8; size as usize];
        let (copied, _) = self.cache.read(path, 0, &mut buf, mtime)?;
        if copied as u64 != size {
            handle.part_failed(1);
            handle.update_status(TransferStatus::Failed);
            return Err(Error::TransferFailed(format!(
                "{}: only {} of {} bytes resident in cache",
                path, copied, size
            )));
        }

        let body = Bytes::from(buf);
        let h = handle.clone();
        let outcome = self
            .retry
            .run("upload", || h.is_cancelled(), || {
                self.client.put_object(path, body.clone())
            })
            .await;
        match outcome {
            Ok(etag) => {
                handle.part_completed(1, &etag);
                handle.set_etag(&etag);
                handle.update_status(TransferStatus::Completed);
                Ok(())
            }
            Err(e) => {
                handle.part_failed(1);
                handle.set_error(e.clone());
                handle.update_status(TransferStatus::Failed);
                Err(transfer_error(path, handle, e))
            }
        }
    }

    async fn upload_multipart(
        &self,
        handle: &Arc<TransferHandle>,
        path: &str,
        size: u64,
        mtime: i64,
    ) -> Result<()> {
        handle.set_multipart(true);
        let h = handle.clone();
        let upload_id = match self
            .retry
            .run("initiate multipart", || h.is_cancelled(), || {
                self.client.initiate_multipart(path)
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                handle.set_error(e.clone());
                handle.update_status(TransferStatus::Failed);
                return Err(transfer_error(path, handle, e));
            }
        };
        handle.set_upload_id(&upload_id);
        self.unfinished
            .lock()
            .unwrap()
            .insert(path.to_string(), handle.clone());

        let mut tasks = Vec::new();
        for (number, (part_offset, part_len)) in cut_parts(0, size, self.transfer_buf_size) {
            handle.add_part(number, part_offset, part_len);
            let client = self.client.clone();
            let cache = self.cache.clone();
            let semaphore = self.semaphore.clone();
            let retry = self.retry;
            let h = handle.clone();
            let path = path.to_string();
            let upload_id = upload_id.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                if !h.should_continue() {
                    h.part_failed(number);
                    return Err(ClientError::Storage("transfer cancelled".to_string()));
                }
                h.part_pending(number);

                let mut buf = vec![0u8; part_len as usize];
                let read = cache
                    .read(&path, part_offset, &mut buf, mtime)
                    .map_err(|e| ClientError::Storage(e.to_string()))?;
                if read.0 as u64 != part_len {
                    h.part_failed(number);
                    return Err(ClientError::Storage(format!(
                        "part {}: only {} of {} bytes resident in cache",
                        number, read.0, part_len
                    )));
                }

                let body = Bytes::from(buf);
                match retry
                    .run("upload part", || h.is_cancelled(), || {
                        client.upload_part(&path, &upload_id, number, body.clone())
                    })
                    .await
                {
                    Ok(etag) => {
                        h.part_completed(number, &etag);
                        Ok(())
                    }
                    Err(e) => {
                        h.part_failed(number);
                        h.set_error(e.clone());
                        Err(e)
                    }
                }
            }));
        }

        let mut first_error: Option<ClientError> = None;
        for joined in join_all(tasks).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(ClientError::Storage(format!("task failed: {}", e)));
                    }
                }
            }
        }

        if first_error.is_none() && handle.all_parts_completed() {
            let parts = handle.completed_parts();
            let h = handle.clone();
            match self
                .retry
                .run("complete multipart", || h.is_cancelled(), || {
                    self.client.complete_multipart(path, &upload_id, &parts)
                })
                .await
            {
                Ok(etag) => {
                    self.unfinished.lock().unwrap().remove(path);
                    handle.set_etag(&etag);
                    handle.update_status(TransferStatus::Completed);
                    return Ok(());
                }
                Err(e) => first_error = Some(e),
            }
        }

        let error = first_error
            .unwrap_or_else(|| ClientError::Storage("multipart upload incomplete".to_string()));
        if let Err(abort_err) = self.client.abort_multipart(path, &upload_id).await {
            tracing::warn!(path = %path, error = %abort_err, "failed to abort multipart upload");
        }
        self.unfinished.lock().unwrap().remove(path);
        handle.set_error(error.clone());
        handle.update_status(TransferStatus::Failed);
        Err(transfer_error(path, handle, error))
    }

    /// Abort every unfinished multipart upload; called on drive shutdown
    pub async fn abort_all(&self) {
        let drained: Vec<(String, Arc<TransferHandle>)> =
            self.unfinished.lock().unwrap().drain().collect();
        for (key, handle) in drained {
            handle.cancel();
            if let Some(upload_id) = handle.upload_id() {
                match self.client.abort_multipart(&key, &upload_id).await {
                    Ok(()) => {
                        tracing::info!(path = %key, "aborted unfinished multipart upload");
                    }
                    Err(e) => {
                        tracing::warn!(path = %key, error = %e, "failed to abort multipart upload");
                    }
                }
            }
        }
    }
}

/// Equal chunks of `buf_size`, the last one taking the remainder.
/// Part numbers are 1-based.
fn cut_parts(offset: u64, len: u64, buf_size: u64) -> Vec<(u16, (u64, u64))> {
    let mut parts = Vec::new();
    let mut begin = offset;
    let stop = offset + len;
    let mut number = 1u16;
    while begin < stop {
        let part_len = buf_size.min(stop - begin);
        parts.push((number, (begin, part_len)));
        begin += part_len;
        number += 1;
    }
    parts
}

fn transfer_error(path: &str, handle: &TransferHandle, error: ClientError) -> Error {
    if handle.is_cancelled() {
        return Error::Cancelled(path.to_string());
    }
    match error {
        ClientError::NotFound(p) => Error::NotFound(p),
        ClientError::InvalidRange { path, offset, len } => {
            Error::InvalidRange { path, offset, len }
        }
        other => Error::TransferFailed(format!("{}: {}", path, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryClient;

    fn options(upload_threshold: u64, download_threshold: u64, buf: u64) -> Options {
        Options {
            multipart_upload_threshold: upload_threshold,
            multipart_download_threshold: download_threshold,
            transfer_buf_size: buf,
            max_retries: 3,
            retry_scale_factor_ms: 1,
            max_parallel_transfers: 2,
            ..Options::default()
        }
    }

    fn engine(
        client: Arc<MemoryClient>,
        opts: &Options,
    ) -> (Arc<Cache>, TransferEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::new(1 << 20, dir.path().join("scratch")));
        let engine = TransferEngine::new(client, cache.clone(), opts);
        (cache, engine, dir)
    }

    #[test]
    fn test_cut_parts() {
        assert_eq!(
            cut_parts(0, 10, 4),
            vec![(1, (0, 4)), (2, (4, 4)), (3, (8, 2))]
        );
        assert_eq!(cut_parts(8, 4, 8), vec![(1, (8, 4))]);
    }

    #[tokio::test]
    async fn test_single_upload_below_threshold() {
        let client = Arc::new(MemoryClient::new());
        let opts = options(100, 100, 4);
        let (cache, engine, _dir) = engine(client.clone(), &opts);

        cache.write("/f", 0, b"abcde", 1).unwrap();
        let handle = engine.upload("/f", 5, 1).await.unwrap();
        assert_eq!(handle.status(), TransferStatus::Completed);
        assert!(!handle.is_multipart());

        let counters = client.counters();
        assert_eq!(counters.puts, 1);
        assert_eq!(counters.initiates, 0);
        let (data, etag) = client.object("/f").unwrap();
        assert_eq!(data, Bytes::from_static(b"abcde"));
        assert_eq!(Some(etag), handle.etag());
    }

    #[tokio::test]
    async fn test_multipart_upload_part_cutting() {
        let client = Arc::new(MemoryClient::new());
        let opts = options(4, 100, 4);
        let (cache, engine, _dir) = engine(client.clone(), &opts);

        cache.write("/big", 0, b"0123456789", 1).unwrap();
        let handle = engine.upload("/big", 10, 1).await.unwrap();
        assert_eq!(handle.status(), TransferStatus::Completed);
        assert!(handle.is_multipart());
        assert_eq!(handle.bytes_transferred(), 10);

        let counters = client.counters();
        assert_eq!(counters.initiates, 1);
        assert_eq!(counters.parts, 3);
        assert_eq!(counters.completes, 1);
        assert_eq!(counters.aborts, 0);
        let (data, _) = client.object("/big").unwrap();
        assert_eq!(data, Bytes::from_static(b"0123456789"));
        assert_eq!(engine.unfinished_count(), 0);
    }

    #[tokio::test]
    async fn test_download_retries_then_succeeds() {
        let client = Arc::new(MemoryClient::new());
        client.insert_object("/f", b"helloworld");
        client.push_download_failure(ClientError::Timeout("one".to_string()));
        client.push_download_failure(ClientError::Timeout("two".to_string()));
        let opts = options(100, 100, 4);
        let (_cache, engine, _dir) = engine(client.clone(), &opts);

        let (handle, data) = engine.download("/f", 0, 10).await.unwrap();
        assert_eq!(handle.status(), TransferStatus::Completed);
        assert_eq!(data, Bytes::from_static(b"helloworld"));
    }

    #[tokio::test]
    async fn test_download_gives_up_after_retry_budget() {
        let client = Arc::new(MemoryClient::new());
        client.insert_object("/f", b"helloworld");
        for _ in 0..3 {
            client.push_download_failure(ClientError::Timeout("down".to_string()));
        }
        let opts = options(100, 100, 4);
        let (_cache, engine, _dir) = engine(client.clone(), &opts);

        let err = engine.download("/f", 0, 10).await.unwrap_err();
        assert!(matches!(err, Error::TransferFailed(_)));
    }

    #[tokio::test]
    async fn test_chunked_download_assembles() {
        let client = Arc::new(MemoryClient::new());
        client.insert_object("/f", b"0123456789");
        let opts = options(100, 4, 4);
        let (_cache, engine, _dir) = engine(client.clone(), &opts);

        let (handle, data) = engine.download("/f", 1, 8).await.unwrap();
        assert_eq!(handle.status(), TransferStatus::Completed);
        assert!(handle.is_multipart());
        assert_eq!(data, Bytes::from_static(b"12345678"));
        assert_eq!(client.counters().downloads, 2);
    }

    #[tokio::test]
    async fn test_abort_all_cleans_remote() {
        let client = Arc::new(MemoryClient::new());
        let opts = options(4, 100, 4);
        let (cache, engine, _dir) = engine(client.clone(), &opts);

        // leave an unfinished upload behind by hand
        let id = client.initiate_multipart("/big").await.unwrap();
        let handle = Arc::new(TransferHandle::new(
            "/big",
            TransferDirection::Upload,
            10,
        ));
        handle.set_upload_id(&id);
        engine
            .unfinished
            .lock()
            .unwrap()
            .insert("/big".to_string(), handle);
        assert_eq!(client.pending_upload_count(), 1);

        engine.abort_all().await;
        assert_eq!(client.pending_upload_count(), 0);
        assert_eq!(engine.unfinished_count(), 0);
        drop(cache);
    }
}
