//! Importing test cases from peer instances sharing a sync directory.
//!
//! Every peer keeps its queue under `<sync-dir>/<peer>/queue/`. For each
//! peer we remember the lowest id not yet looked at in `.synced/<peer>`,
//! stored as four little-endian bytes.

use crate::executor::Executor;
use crate::fuzzer::{FuzzError, Fuzzer};
use crate::mutator::MAX_FILE;
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to scan sync directory {path:?}: {source}")]
    Scan { path: PathBuf, source: io::Error },
    #[error("Failed to update sync mark {path:?}: {source}")]
    Mark { path: PathBuf, source: io::Error },
}

/// Parses the numeric id out of a queue file name like `id:000042,...`.
fn case_id(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("id:")?;
    let digits = rest.get(..6)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn read_mark(path: &Path) -> u32 {
    match fs::read(path) {
        Ok(bytes) if bytes.len() >= 4 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => 0,
    }
}

fn peers(sync_dir: &Path, own_id: &str) -> Result<Vec<String>, SyncError> {
    let entries = fs::read_dir(sync_dir).map_err(|source| SyncError::Scan {
        path: sync_dir.to_path_buf(),
        source,
    })?;
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| !n.starts_with('.') && n != own_id)
        .collect();
    names.sort();
    Ok(names)
}

impl<E: Executor> Fuzzer<E> {
    /// Pulls new queue entries from every peer and keeps the ones that are
    /// interesting to us.
    pub(crate) fn sync_fuzzers(&mut self) -> Result<(), FuzzError> {
        let Some(sync) = self.sync.clone() else {
            return Ok(());
        };

        for peer in peers(&sync.sync_dir, &sync.sync_id)? {
            let queue_dir = sync.sync_dir.join(&peer).join("queue");
            let Ok(entries) = fs::read_dir(&queue_dir) else {
                continue;
            };

            let mark_path = self.state.layout.synced_dir().join(&peer);
            let min_accept = read_mark(&mark_path);
            let mut next_min_accept = min_accept;

            let mut cases: Vec<(u32, PathBuf)> = entries
                .filter_map(Result::ok)
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    let id = case_id(&name)?;
                    (id >= min_accept).then(|| (id, e.path()))
                })
                .collect();
            cases.sort();

            debug!("syncing with '{peer}', {} candidates from id {min_accept}", cases.len());
            let mut imported = 0;

            for (id, path) in cases {
                next_min_accept = next_min_accept.max(id + 1);

                let Ok(meta) = fs::metadata(&path) else {
                    continue;
                };
                if !meta.is_file() || meta.len() == 0 || meta.len() > MAX_FILE as u64 {
                    continue;
                }
                let Ok(buf) = fs::read(&path) else {
                    continue;
                };

                let fault = self.execute(&buf, self.state.exec_tmout)?;
                if self.stopping() {
                    return Ok(());
                }

                self.state.cur_depth = 0;
                self.state.stage.syncing = Some((peer.clone(), id));
                let kept = self.save_if_interesting(&buf, fault);
                self.state.stage.syncing = None;
                if kept? {
                    imported += 1;
                }
            }

            fs::write(&mark_path, next_min_accept.to_le_bytes()).map_err(|source| SyncError::Mark {
                path: mark_path.clone(),
                source,
            })?;

            if imported > 0 {
                info!("imported {imported} test cases from '{peer}'");
                self.state.counters.queued_imported += imported;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::fuzzer::tests::mock_fuzzer;

    #[test]
    fn parses_case_ids() {
        assert_eq!(case_id("id:000042,orig:seed"), Some(42));
        assert_eq!(case_id("id:000007"), Some(7));
        assert_eq!(case_id("id:12"), None);
        assert_eq!(case_id("README.txt"), None);
        assert_eq!(case_id("id:00a001,src:000000"), None);
    }

    fn write_case(dir: &Path, name: &str, data: &[u8]) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), data).unwrap();
    }

    #[test]
    fn imports_new_peer_cases_once() {
        let (dir, mut fuzzer) = mock_fuzzer(&[b"hello"], |_| {});
        let sync_dir = dir.path().join("sync");
        fuzzer.sync = Some(SyncSettings {
            sync_dir: sync_dir.clone(),
            sync_id: "main".into(),
            interval: 5,
            import_first: false,
        });
        fuzzer.setup().unwrap();

        let peer_queue = sync_dir.join("peer1").join("queue");
        write_case(&peer_queue, "id:000000,orig:a", b"abc");
        write_case(&peer_queue, "id:000001,src:000000,op:havoc,rep:2", b"zzzzz");
        write_case(&peer_queue, "id:000002,src:000001,op:flip1,pos:0", b"");
        write_case(&peer_queue, "README", b"not a case");
        fs::create_dir_all(peer_queue.join(".state")).unwrap();
        write_case(&sync_dir.join("main").join("queue"), "id:000000,orig:own", b"mine");

        fuzzer.sync_fuzzers().unwrap();

        assert_eq!(fuzzer.state.counters.queued_imported, 2);
        assert_eq!(fuzzer.state.queue.len(), 3);
        let names: Vec<String> = fuzzer.state.queue.iter().map(|e| e.file_name()).collect();
        assert_eq!(names[1], "id:000001,sync:peer1,src:000000,+cov");
        assert_eq!(names[2], "id:000002,sync:peer1,src:000001,+cov");
        assert_eq!(fuzzer.state.queue.get(1).unwrap().depth, 1);
        assert!(fuzzer.state.stage.syncing.is_none());

        let mark = fs::read(fuzzer.state.layout.synced_dir().join("peer1")).unwrap();
        assert_eq!(mark, 3u32.to_le_bytes());
        assert!(!fuzzer.state.layout.synced_dir().join("main").exists());

        let runs = fuzzer.executor().runs;
        fuzzer.sync_fuzzers().unwrap();
        assert_eq!(fuzzer.executor().runs, runs);
        assert_eq!(fuzzer.state.queue.len(), 3);

        write_case(&peer_queue, "id:000003,src:000000,op:arith8,pos:1,val:+1", b"qrstu");
        fuzzer.sync_fuzzers().unwrap();
        assert_eq!(fuzzer.state.counters.queued_imported, 3);
        let mark = fs::read(fuzzer.state.layout.synced_dir().join("peer1")).unwrap();
        assert_eq!(mark, 4u32.to_le_bytes());
    }

    #[test]
    fn missing_peer_queue_is_ignored() {
        let (dir, mut fuzzer) = mock_fuzzer(&[b"hello"], |_| {});
        let sync_dir = dir.path().join("sync");
        fs::create_dir_all(sync_dir.join("idle")).unwrap();
        fuzzer.sync = Some(SyncSettings {
            sync_dir,
            sync_id: "main".into(),
            interval: 1,
            import_first: true,
        });
        fuzzer.setup().unwrap();
        fuzzer.sync_fuzzers().unwrap();
        assert_eq!(fuzzer.state.counters.queued_imported, 0);
        assert_eq!(fuzzer.executor().runs, 0);
    }
}
