use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

pub const DB_FILE: &str = "db.jsonl";
pub const ANSWER_FILE: &str = "answer.csv";
pub const REVERSE_INDEX_FILE: &str = "reverse_index.json";
pub const UNLABELLED_FILE: &str = "unlabelled.json";

/// Idiom id to the tags of the instances that blank it.
pub type ReverseIndex = BTreeMap<usize, Vec<String>>;

/// A preprocessed blanked-sentence instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Instance {
    pub tag: String,

    /// Token ids of the sentence with a single mask token for the idiom.
    pub input_ids: Vec<u32>,

    /// Index of the mask token in `input_ids`.
    pub position: usize,

    pub idiom: usize,

    /// Index of the idiom in `options`, `-100` when unknown.
    pub target: i64,

    /// Either empty or exactly seven option idiom ids.
    pub options: Vec<usize>,
}

/// Read-only store of preprocessed instances.
///
/// Instances keep the order of the store file.
pub struct InstanceStore {
    dir: PathBuf,
    instances: Vec<Instance>,
    index: FnvHashMap<String, usize>,
}

impl InstanceStore {
    /// Open the store in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let path = dir.join(DB_FILE);
        let f = File::open(&path)
            .with_context(|| format!("Cannot open instance store {}", path.display()))?;

        let mut instances = Vec::new();
        let mut index = FnvHashMap::default();
        for (line_idx, line) in BufReader::new(f).lines().enumerate() {
            let line = line.with_context(|| format!("Cannot read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }

            let instance: Instance = serde_json::from_str(&line).with_context(|| {
                format!(
                    "Malformed instance on line {} of {}",
                    line_idx + 1,
                    path.display()
                )
            })?;
            index.insert(instance.tag.clone(), instances.len());
            instances.push(instance);
        }

        Ok(InstanceStore {
            dir: dir.to_owned(),
            instances,
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, tag: &str) -> Option<&Instance> {
        self.index.get(tag).map(|&idx| &self.instances[idx])
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn read_reverse_index(&self) -> Result<ReverseIndex> {
        read_json(self.dir.join(REVERSE_INDEX_FILE))
    }

    /// Read `answer.csv`: instance tag to gold option index.
    #[cfg(test)]
    pub(crate) fn read_answers(&self) -> Result<FnvHashMap<String, i64>> {
        let path = self.dir.join(ANSWER_FILE);
        let f = File::open(&path)
            .with_context(|| format!("Cannot open answer file {}", path.display()))?;
        read_csv_pairs(BufReader::new(f))
            .with_context(|| format!("Cannot read answer file {}", path.display()))
    }
}

/// Sequential writer for the instance store.
pub struct StoreWriter {
    db: BufWriter<File>,
    answers: BufWriter<File>,
    reverse_index: ReverseIndex,
    dir: PathBuf,
    len: usize,
}

impl StoreWriter {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create store directory {}", dir.display()))?;
        let db = File::create(dir.join(DB_FILE)).context("Cannot create instance file")?;
        let answers = File::create(dir.join(ANSWER_FILE)).context("Cannot create answer file")?;

        Ok(StoreWriter {
            db: BufWriter::new(db),
            answers: BufWriter::new(answers),
            reverse_index: ReverseIndex::new(),
            dir: dir.to_owned(),
            len: 0,
        })
    }

    pub fn push(&mut self, instance: &Instance) -> Result<()> {
        serde_json::to_writer(&mut self.db, instance).context("Cannot serialize instance")?;
        writeln!(self.db).context("Cannot write instance")?;
        writeln!(self.answers, "{},{}", instance.tag, instance.target)
            .context("Cannot write answer")?;
        self.reverse_index
            .entry(instance.idiom)
            .or_default()
            .push(instance.tag.clone());
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flush the instances and write the reverse index.
    pub fn finish(mut self) -> Result<ReverseIndex> {
        self.db.flush().context("Cannot flush instance file")?;
        self.answers.flush().context("Cannot flush answer file")?;
        write_json(self.dir.join(REVERSE_INDEX_FILE), &self.reverse_index)?;
        Ok(self.reverse_index)
    }
}

/// Read `key,value` lines.
pub fn read_csv_pairs<R, V>(read: R) -> Result<FnvHashMap<String, V>>
where
    R: BufRead,
    V: std::str::FromStr,
    V::Err: std::error::Error + Send + Sync + 'static,
{
    let mut pairs = FnvHashMap::default();
    for (line_idx, line) in read.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.rsplitn(2, ',');
        let value = parts.next().unwrap_or_default();
        let key = parts
            .next()
            .with_context(|| format!("Line {} is not a key,value pair", line_idx + 1))?;
        let value = value
            .parse()
            .with_context(|| format!("Cannot parse value on line {}", line_idx + 1))?;
        pairs.insert(key.to_owned(), value);
    }

    Ok(pairs)
}

pub(crate) fn read_json<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(f))
        .with_context(|| format!("Cannot parse {}", path.display()))
}

pub(crate) fn write_json<T>(path: impl AsRef<Path>, value: &T) -> Result<()>
where
    T: Serialize,
{
    let path = path.as_ref();
    let f = File::create(path).with_context(|| format!("Cannot create {}", path.display()))?;
    let mut writer = BufWriter::new(f);
    serde_json::to_writer(&mut writer, value)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Cannot flush {}", path.display()))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;

    use super::{read_csv_pairs, Instance, InstanceStore, StoreWriter};

    pub(crate) fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "idiomcloze-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub(crate) fn instance(tag: &str, idiom: usize) -> Instance {
        Instance {
            tag: tag.to_string(),
            input_ids: vec![7, 8, 3, 9],
            position: 2,
            idiom,
            target: -100,
            options: vec![],
        }
    }

    #[test]
    fn write_and_open_store() {
        let dir = scratch_dir("store");
        let mut writer = StoreWriter::create(&dir).unwrap();
        writer.push(&instance("#idiom000000#", 4)).unwrap();
        writer.push(&instance("#idiom000001#", 2)).unwrap();
        writer.push(&instance("#idiom000020#", 4)).unwrap();
        let reverse_index = writer.finish().unwrap();

        assert_eq!(
            reverse_index,
            btreemap! {
                2 => vec!["#idiom000001#".to_string()],
                4 => vec!["#idiom000000#".to_string(), "#idiom000020#".to_string()],
            }
        );

        let store = InstanceStore::open(&dir).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.get("#idiom000001#").unwrap().idiom, 2);
        assert!(store.get("#idiom000002#").is_none());
        assert_eq!(store.read_reverse_index().unwrap(), reverse_index);
        assert_eq!(store.read_answers().unwrap()["#idiom000020#"], -100);
    }

    #[test]
    fn malformed_instances_are_rejected() {
        let dir = scratch_dir("store-malformed");
        std::fs::write(
            dir.join(super::DB_FILE),
            "{\"tag\": \"a\", \"input_ids\": [1], \"position\": 0, \"idiom\": 0, \
             \"target\": 0, \"options\": [], \"extra\": 1}\n",
        )
        .unwrap();
        assert!(InstanceStore::open(&dir).is_err());
    }

    #[test]
    fn csv_pairs() {
        let pairs = read_csv_pairs::<_, i64>(Cursor::new("a,1\n\nb,-100\n")).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs["b"], -100);
        assert!(read_csv_pairs::<_, i64>(Cursor::new("a;1\n")).is_err());
    }
}
