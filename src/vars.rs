use crate::prelude::*;
use crate::util::{fix_file_perms, lock_unpoisoned};
use std::fs::File;
use std::io::BufReader;
use std::sync::Mutex;

// Small facts that must survive process restarts: the newest source-tree
// modification time anyone has observed (the search cache's invalidation
// signal) and the preview line count the preview cache was built with. One
// CBOR file, fixed schema, each mutation an atomic replace.

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct VarsData {
    latest_mtime: Option<Timestamp>,
    preview_lines: Option<u32>,
}

#[derive(Debug)]
pub struct VarStore {
    path: PathBuf,
    data: Mutex<VarsData>,
}

impl VarStore {
    pub fn open(path: &Path) -> Result<VarStore> {
        let data = match File::open(path) {
            Ok(file) => {
                fix_file_perms(&file)
                    .wrap_err_with(|| format!("fixing permissions on {}", path.display()))?;
                match ciborium::de::from_reader(BufReader::new(file)) {
                    Ok(data) => data,
                    Err(err) => {
                        // Self-heal like the entry headers do: a mangled vars
                        // file costs one preview-cache reset and one full
                        // search re-scan, both of which regenerate cleanly.
                        warn!(path = %path.display(), %err, "runtime vars unreadable; resetting");
                        VarsData::default()
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => VarsData::default(),
            Err(err) => {
                return Err(err).wrap_err_with(|| format!("opening {}", path.display()))
            }
        };
        Ok(VarStore {
            path: path.to_path_buf(),
            data: Mutex::new(data),
        })
    }

    pub fn latest_mtime(&self) -> Option<Timestamp> {
        lock_unpoisoned(&self.data).latest_mtime
    }

    pub fn set_latest_mtime(&self, value: Option<Timestamp>) -> Result<()> {
        self.update(|data| data.latest_mtime = value)
    }

    pub fn preview_lines(&self) -> Option<u32> {
        lock_unpoisoned(&self.data).preview_lines
    }

    pub fn set_preview_lines(&self, value: Option<u32>) -> Result<()> {
        self.update(|data| data.preview_lines = value)
    }

    fn update(&self, mutate: impl FnOnce(&mut VarsData)) -> Result<()> {
        let mut guard = lock_unpoisoned(&self.data);
        let mut next = guard.clone();
        mutate(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    fn persist(&self, data: &VarsData) -> Result<()> {
        // unwrap rationale: the store path always has a parent (it lives
        // inside the cache directory).
        let dir = self.path.parent().unwrap();
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        ciborium::ser::into_writer(data, &mut tmp)?;
        tmp.as_file().sync_data()?;
        let file = tmp
            .persist(&self.path)
            .wrap_err_with(|| format!("replacing {}", self.path.display()))?;
        fix_file_perms(&file)?;
        Ok(())
    }
}
