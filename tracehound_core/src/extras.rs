use crate::mutator::{INTERESTING_16, INTERESTING_32};
use log::{info, warn};
use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MIN_AUTO_EXTRA: usize = 3;
pub const MAX_AUTO_EXTRA: usize = 32;
pub const MAX_DICT_FILE: usize = 128;
/// Above this many user tokens the deterministic dictionary stages sample.
pub const MAX_DET_EXTRAS: usize = 200;
/// Auto tokens actually used for fuzzing and persisted at shutdown.
pub const USE_AUTO_EXTRAS: usize = 50;
pub const MAX_AUTO_EXTRAS: usize = USE_AUTO_EXTRAS * 10;

#[derive(Error, Debug)]
pub enum ExtrasError {
    #[error("Dictionary I/O error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Dictionary token {path:?} is {len} bytes; tokens must be 1..={max} bytes")]
    BadTokenSize {
        path: PathBuf,
        len: usize,
        max: usize,
    },
    #[error("No dictionary tokens found in {0:?}")]
    Empty(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extra {
    pub data: Vec<u8>,
    pub hit_cnt: u32,
}

/// User-supplied tokens, sorted by length, plus the auto-extracted pool.
#[derive(Debug, Default)]
pub struct Extras {
    pub user: Vec<Extra>,
    pub auto: Vec<Extra>,
    auto_changed: bool,
}

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.auto.is_empty()
    }

    /// The slice of auto tokens the mutation stages draw from.
    pub fn auto_in_use(&self) -> &[Extra] {
        &self.auto[..self.auto.len().min(USE_AUTO_EXTRAS)]
    }

    /// Loads every regular file in `dir` as one raw token.
    pub fn load_user_dir(&mut self, dir: &Path) -> Result<usize, ExtrasError> {
        let io_err = |path: &Path, source| ExtrasError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| io_err(dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && !p
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            })
            .collect();
        paths.sort();

        for path in paths {
            let data = fs::read(&path).map_err(|e| io_err(&path, e))?;
            if data.is_empty() || data.len() > MAX_DICT_FILE {
                return Err(ExtrasError::BadTokenSize {
                    path,
                    len: data.len(),
                    max: MAX_DICT_FILE,
                });
            }
            self.user.push(Extra { data, hit_cnt: 0 });
        }

        if self.user.is_empty() {
            return Err(ExtrasError::Empty(dir.to_path_buf()));
        }

        self.user.sort_by_key(|e| e.data.len());
        info!(
            "loaded {} dictionary tokens, {}..={} bytes",
            self.user.len(),
            self.user[0].data.len(),
            self.user[self.user.len() - 1].data.len()
        );
        if self.user.len() > MAX_DET_EXTRAS {
            warn!(
                "more than {MAX_DET_EXTRAS} tokens; deterministic dictionary stages will sample them"
            );
        }
        Ok(self.user.len())
    }

    /// Considers a byte string mined during the walking-bit stage.
    ///
    /// Uniform runs, values the interesting-integer stages already cover and
    /// strings matching a user token (case-insensitively) are dropped. A
    /// repeat of an auto token bumps its hit count instead of adding it.
    pub fn maybe_add_auto<R: Rng>(&mut self, mem: &[u8], rng: &mut R) {
        let len = mem.len();
        if len == 0 || mem.iter().all(|&b| b == mem[0]) {
            return;
        }

        if len == 2 {
            let v = u16::from_le_bytes([mem[0], mem[1]]);
            if INTERESTING_16
                .iter()
                .any(|&i| v == i as u16 || v == (i as u16).swap_bytes())
            {
                return;
            }
        }
        if len == 4 {
            let v = u32::from_le_bytes([mem[0], mem[1], mem[2], mem[3]]);
            if INTERESTING_32
                .iter()
                .any(|&i| v == i as u32 || v == (i as u32).swap_bytes())
            {
                return;
            }
        }

        if self
            .user
            .iter()
            .filter(|e| e.data.len() == len)
            .any(|e| e.data.eq_ignore_ascii_case(mem))
        {
            return;
        }

        self.auto_changed = true;

        if let Some(existing) = self
            .auto
            .iter_mut()
            .find(|e| e.data.len() == len && e.data.eq_ignore_ascii_case(mem))
        {
            existing.hit_cnt += 1;
        } else if self.auto.len() < MAX_AUTO_EXTRAS {
            self.auto.push(Extra {
                data: mem.to_vec(),
                hit_cnt: 0,
            });
        } else {
            let victim =
                MAX_AUTO_EXTRAS / 2 + rng.random_range(0..(MAX_AUTO_EXTRAS + 1) / 2);
            self.auto[victim] = Extra {
                data: mem.to_vec(),
                hit_cnt: 0,
            };
        }

        self.auto.sort_by(|a, b| b.hit_cnt.cmp(&a.hit_cnt));
        let top = self.auto.len().min(USE_AUTO_EXTRAS);
        self.auto[..top].sort_by_key(|e| e.data.len());
    }

    /// Writes the tokens in use to `dir/auto_NNNNNN`, if the pool changed.
    pub fn save_auto(&mut self, dir: &Path) -> Result<(), ExtrasError> {
        if !self.auto_changed {
            return Ok(());
        }
        self.auto_changed = false;

        for (i, extra) in self.auto_in_use().iter().enumerate() {
            let path = dir.join(format!("auto_{i:06}"));
            fs::write(&path, &extra.data).map_err(|source| ExtrasError::Io { path, source })?;
        }
        Ok(())
    }

    /// Reloads tokens saved by a previous run of this instance.
    pub fn load_auto<R: Rng>(&mut self, dir: &Path, rng: &mut R) -> Result<usize, ExtrasError> {
        let mut loaded = 0;
        for i in 0..USE_AUTO_EXTRAS {
            let path = dir.join(format!("auto_{i:06}"));
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(source) => return Err(ExtrasError::Io { path, source }),
            };
            if (MIN_AUTO_EXTRA..=MAX_AUTO_EXTRA).contains(&data.len()) {
                self.maybe_add_auto(&data, rng);
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!("loaded {loaded} auto-discovered dictionary tokens");
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::from_seed([7; 32])
    }

    #[test]
    fn uniform_runs_and_interesting_values_are_rejected() {
        let mut extras = Extras::new();
        let mut r = rng();
        extras.maybe_add_auto(b"aaaa", &mut r);
        extras.maybe_add_auto(&1000u16.to_le_bytes(), &mut r);
        extras.maybe_add_auto(&1000u16.to_be_bytes(), &mut r);
        extras.maybe_add_auto(&65536u32.to_be_bytes(), &mut r);
        assert!(extras.auto.is_empty());
    }

    #[test]
    fn repeated_token_counts_hits_case_insensitively() {
        let mut extras = Extras::new();
        let mut r = rng();
        extras.maybe_add_auto(b"IHDR", &mut r);
        extras.maybe_add_auto(b"ihdr", &mut r);
        assert_eq!(extras.auto.len(), 1);
        assert_eq!(extras.auto[0].hit_cnt, 1);
    }

    #[test]
    fn user_tokens_shadow_auto_candidates() {
        let mut extras = Extras::new();
        extras.user.push(Extra {
            data: b"magic".to_vec(),
            hit_cnt: 0,
        });
        extras.maybe_add_auto(b"MAGIC", &mut rng());
        assert!(extras.auto.is_empty());
    }

    #[test]
    fn top_tokens_are_sorted_by_length() {
        let mut extras = Extras::new();
        let mut r = rng();
        for token in [&b"longest_token"[..], b"abc", b"medium!"] {
            extras.maybe_add_auto(token, &mut r);
        }
        let lens: Vec<usize> = extras.auto_in_use().iter().map(|e| e.data.len()).collect();
        assert_eq!(lens, vec![3, 7, 13]);
    }

    #[test]
    fn full_pool_evicts_from_bottom_half() {
        let mut extras = Extras::new();
        let mut r = rng();
        for i in 0..MAX_AUTO_EXTRAS as u32 {
            extras.maybe_add_auto(format!("tok{i:05}").as_bytes(), &mut r);
        }
        assert_eq!(extras.auto.len(), MAX_AUTO_EXTRAS);
        extras.maybe_add_auto(b"newcomer", &mut r);
        assert_eq!(extras.auto.len(), MAX_AUTO_EXTRAS);
        assert!(extras.auto.iter().any(|e| e.data == b"newcomer"));
    }

    #[test]
    fn auto_tokens_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = rng();
        let mut extras = Extras::new();
        extras.maybe_add_auto(b"PNG\r", &mut r);
        extras.maybe_add_auto(b"IEND", &mut r);
        extras.save_auto(dir.path()).unwrap();
        assert!(dir.path().join("auto_000000").exists());

        let mut restored = Extras::new();
        assert_eq!(restored.load_auto(dir.path(), &mut r).unwrap(), 2);
        assert_eq!(restored.auto.len(), 2);
    }

    #[test]
    fn user_dir_rejects_oversized_tokens() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok"), b"GET").unwrap();
        fs::write(dir.path().join("huge"), vec![b'x'; MAX_DICT_FILE + 1]).unwrap();
        let err = Extras::new().load_user_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ExtrasError::BadTokenSize { .. }));
    }

    #[test]
    fn user_dir_tokens_are_sorted_by_length() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"POST").unwrap();
        fs::write(dir.path().join("b"), b"GET").unwrap();
        fs::write(dir.path().join(".hidden"), b"ignored").unwrap();
        let mut extras = Extras::new();
        assert_eq!(extras.load_user_dir(dir.path()).unwrap(), 2);
        assert_eq!(extras.user[0].data, b"GET");
    }
}
