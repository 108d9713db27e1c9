use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use fnv::{FnvHashMap, FnvHashSet};
use ndarray::Array1;
use rand::Rng;
use tracing::info;

use crate::assemble::assemble;
use crate::collate::{fill_options, Example};
use crate::config::DatasetVariant;
use crate::lexicon::{read_id_list, Affection, Lexicon};
use crate::store::{InstanceStore, ReverseIndex, UNLABELLED_FILE};
use crate::target::{LabelCounter, TargetResolver};
use crate::tokenizer::{load_tokenizer, SpecialIds, Tokenizer};
use crate::util::{N_FINE_EMOTIONS, N_SENTIMENTS};
use crate::vocab::{EnlargedCandidates, IdiomVocab};
use crate::window::Window;

/// Data splits.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn try_from_str(split: &str) -> Result<Split> {
        match split {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            _ => bail!("Unknown split: {}", split),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }

    /// File with the labelled idiom ids of the split.
    pub fn labelled_file(self) -> String {
        format!("{}.json", self.name())
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read-only tables shared by all datasets of a run.
pub struct DatasetResources {
    vocab: IdiomVocab,
    affections: FnvHashMap<usize, Affection>,
    tokenizer: Box<dyn Tokenizer>,
    special: SpecialIds,
    idiom_tokens: Vec<Vec<u32>>,
}

impl DatasetResources {
    pub fn new(vocab: IdiomVocab, lexicon: &Lexicon, tokenizer: Box<dyn Tokenizer>) -> Result<Self> {
        let mut idiom_tokens = Vec::with_capacity(vocab.len());
        for idiom in vocab.idioms() {
            let tokens = tokenizer.tokenize(idiom)?;
            ensure!(!tokens.is_empty(), "Idiom '{}' has no tokens", idiom);
            idiom_tokens.push(tokenizer.convert_tokens_to_ids(&tokens));
        }

        let affections = lexicon.by_id(&vocab);
        info!(
            "{} of {} lexicon entries are in the idiom vocabulary",
            affections.len(),
            lexicon.len()
        );

        Ok(DatasetResources {
            special: tokenizer.special_ids(),
            vocab,
            affections,
            tokenizer,
            idiom_tokens,
        })
    }

    /// Load the idiom vocabulary, lexicon and tokenizer.
    pub fn load(
        vocab: impl AsRef<Path>,
        lexicon: impl AsRef<Path>,
        tokenizer: impl AsRef<Path>,
    ) -> Result<Self> {
        let vocab_path = vocab.as_ref();
        let f = std::fs::File::open(vocab_path).with_context(|| {
            format!("Cannot open idiom vocabulary {}", vocab_path.display())
        })?;
        let vocab = IdiomVocab::read(std::io::BufReader::new(f))?;
        let lexicon = Lexicon::read(lexicon)?;
        let tokenizer = load_tokenizer(tokenizer)?;
        Self::new(vocab, &lexicon, tokenizer)
    }

    pub fn vocab(&self) -> &IdiomVocab {
        &self.vocab
    }

    pub fn affections(&self) -> &FnvHashMap<usize, Affection> {
        &self.affections
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn special_ids(&self) -> SpecialIds {
        self.special
    }

    /// Token ids of the idiom with the given id.
    pub fn idiom_tokens(&self, idiom: usize) -> &[u32] {
        &self.idiom_tokens[idiom]
    }
}

/// Settings shared by the datasets of a run.
#[derive(Clone)]
pub struct DatasetBuilder {
    resources: Arc<DatasetResources>,
    variant: DatasetVariant,
    max_txt_len: usize,
    len_idiom_vocab: usize,
}

impl DatasetBuilder {
    pub fn new(
        resources: Arc<DatasetResources>,
        variant: DatasetVariant,
        max_txt_len: usize,
        len_idiom_vocab: usize,
    ) -> Result<Self> {
        ensure!(
            len_idiom_vocab <= resources.vocab().len(),
            "Idiom vocabulary length {} exceeds the vocabulary size {}",
            len_idiom_vocab,
            resources.vocab().len()
        );
        Ok(DatasetBuilder {
            resources,
            variant,
            max_txt_len,
            len_idiom_vocab,
        })
    }

    pub fn resources(&self) -> &DatasetResources {
        &self.resources
    }

    /// Build the dataset of a split from its store directory.
    ///
    /// The enlarged candidates are computed for the training split when
    /// `candidates` is `None`. Other splits must reuse the candidates of
    /// the training split.
    pub fn build(
        &self,
        split: Split,
        dir: impl AsRef<Path>,
        candidates: Option<Arc<EnlargedCandidates>>,
    ) -> Result<AffectionDataset> {
        let dir = dir.as_ref();
        let store = InstanceStore::open(dir)?;
        let labelled = read_id_list(dir.join(split.labelled_file()))?;
        let unlabelled = read_id_list(dir.join(UNLABELLED_FILE))?;

        let use_unlabelled = split == Split::Train && self.variant.use_unlabeled;
        let reverse_index = allowed_reverse_index(
            store.read_reverse_index()?,
            self.len_idiom_vocab,
            &labelled,
            if use_unlabelled {
                Some(&unlabelled)
            } else {
                None
            },
        );

        let candidates = match (candidates, split) {
            (Some(candidates), _) => candidates,
            (None, Split::Train) => Arc::new(if use_unlabelled {
                EnlargedCandidates::from_members(self.len_idiom_vocab, |id| {
                    reverse_index.contains_key(&id)
                })
            } else {
                EnlargedCandidates::from_members(self.len_idiom_vocab, |id| labelled.contains(&id))
            }),
            (None, split) => bail!(
                "The {} split requires the enlarged candidates of the training split",
                split
            ),
        };

        let allowed: FnvHashSet<&str> = reverse_index
            .values()
            .flatten()
            .map(String::as_str)
            .collect();
        if let Some(tag) = allowed.iter().find(|tag| store.get(tag).is_none()) {
            bail!(
                "Reverse index of {} refers to the missing instance {}",
                dir.display(),
                tag
            );
        }

        let mut entries = Vec::new();
        let mut fine_emotions = LabelCounter::new();
        let mut sentiments = LabelCounter::new();
        let resolver = TargetResolver::new(self.resources.affections(), &labelled);
        for (idx, instance) in store.instances().iter().enumerate() {
            if !allowed.contains(instance.tag.as_str()) {
                continue;
            }

            ensure!(
                instance.position < instance.input_ids.len()
                    && instance.input_ids[instance.position] == self.resources.special.mask,
                "Instance {} does not have a mask token at position {}",
                instance.tag,
                instance.position
            );

            if let Some(affection) = resolver.annotation(instance.idiom) {
                fine_emotions.update(affection.fine_emotion);
                sentiments.update(affection.sentiment);
            }

            let window = Window::around(
                instance.input_ids.len(),
                instance.position,
                self.max_txt_len,
            );
            entries.push((idx, window));
        }

        info!(
            "{} split: {} of {} instances, {} enlarged candidates",
            split,
            entries.len(),
            store.len(),
            candidates.len()
        );
        info!("Fine emotion counter: {}", fine_emotions);
        info!("Sentiment counter: {}", sentiments);

        Ok(AffectionDataset {
            split,
            resources: self.resources.clone(),
            variant: self.variant,
            max_txt_len: self.max_txt_len,
            len_idiom_vocab: self.len_idiom_vocab,
            store,
            labelled,
            reverse_index,
            candidates,
            entries,
            fine_emotions,
            sentiments,
        })
    }
}

/// Restrict the reverse index to idioms in `0..len_idiom_vocab` that are
/// labelled, or unlabelled when `unlabelled` is given.
fn allowed_reverse_index(
    reverse_index: ReverseIndex,
    len_idiom_vocab: usize,
    labelled: &FnvHashSet<usize>,
    unlabelled: Option<&FnvHashSet<usize>>,
) -> ReverseIndex {
    reverse_index
        .into_iter()
        .filter(|(idiom, _)| *idiom < len_idiom_vocab)
        .filter(|(idiom, _)| {
            labelled.contains(idiom) || unlabelled.map(|u| u.contains(idiom)).unwrap_or(false)
        })
        .collect()
}

/// Dataset of blanked idiom instances with affective targets.
pub struct AffectionDataset {
    split: Split,
    resources: Arc<DatasetResources>,
    variant: DatasetVariant,
    max_txt_len: usize,
    len_idiom_vocab: usize,
    store: InstanceStore,
    labelled: FnvHashSet<usize>,
    reverse_index: ReverseIndex,
    candidates: Arc<EnlargedCandidates>,
    entries: Vec<(usize, Window)>,
    fine_emotions: LabelCounter,
    sentiments: LabelCounter,
}

impl AffectionDataset {
    pub fn split(&self) -> Split {
        self.split
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn candidates(&self) -> &Arc<EnlargedCandidates> {
        &self.candidates
    }

    pub fn reverse_index(&self) -> &ReverseIndex {
        &self.reverse_index
    }

    pub fn store_dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn fine_emotion_weights(&self) -> Array1<f32> {
        self.fine_emotions.class_weights(N_FINE_EMOTIONS)
    }

    pub fn sentiment_weights(&self) -> Array1<f32> {
        self.sentiments.class_weights(N_SENTIMENTS)
    }

    /// Tag of the `i`-th instance.
    pub fn qid(&self, i: usize) -> &str {
        &self.store.instances()[self.entries[i].0].tag
    }

    /// Gold sentiments of the annotated instances, keyed by tag.
    pub fn sentiment_answers(&self) -> FnvHashMap<String, i64> {
        let resolver = TargetResolver::new(self.resources.affections(), &self.labelled);
        self.entries
            .iter()
            .filter_map(|&(idx, _)| {
                let instance = &self.store.instances()[idx];
                resolver
                    .annotation(instance.idiom)
                    .map(|affection| (instance.tag.clone(), affection.sentiment))
            })
            .collect()
    }

    /// Construct the `i`-th example.
    ///
    /// Examples are rebuilt on every call, `rng` only affects the options
    /// of instances that were stored without options.
    pub fn get<R>(&self, i: usize, rng: &mut R) -> Example
    where
        R: Rng,
    {
        let (idx, window) = self.entries[i];
        let instance = &self.store.instances()[idx];

        let options = fill_options(
            &instance.options,
            instance.idiom,
            self.len_idiom_vocab,
            rng,
        );

        let resolver = TargetResolver::new(self.resources.affections(), &self.labelled);
        let target = resolver.resolve(
            instance.idiom,
            self.candidates.target_index(instance.idiom),
        );

        let assembled = assemble(
            window.slice(&instance.input_ids),
            self.resources.idiom_tokens(instance.idiom),
            self.resources.special_ids(),
            self.variant,
            self.max_txt_len,
        );

        Example {
            qid: instance.tag.clone(),
            assembled,
            options,
            target,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use fnv::FnvHashSet;

    use super::{allowed_reverse_index, DatasetBuilder, DatasetResources, Split};
    use crate::config::DatasetVariant;
    use crate::lexicon::{write_id_list, Lexicon};
    use crate::store::tests::scratch_dir;
    use crate::store::{Instance, StoreWriter, UNLABELLED_FILE};
    use crate::tokenizer::tests::test_tokenizer;
    use crate::util::{seeded_rng, IGNORE_INDEX, N_OPTIONS};
    use crate::vocab::{EnlargedCandidates, IdiomVocab};

    static LEXICON: &str = r#"{
        "守株待兔": {"coarse_emotion": 2, "fine_emotion": 7, "sentiment": 2, "strength": 5},
        "画蛇添足": {"coarse_emotion": 1, "fine_emotion": 3, "sentiment": 1, "strength": 3}
    }"#;

    // Ids 0 and 1 are labelled, 2 is unlabelled, 7 is outside of the
    // used vocabulary.
    pub(crate) fn test_resources() -> Arc<DatasetResources> {
        let mut idioms = vec!["守株待兔".to_string(), "画蛇添足".to_string(), "他们".to_string()];
        for c in &["守", "株", "待", "兔", "画", "蛇", "添", "足"] {
            idioms.push(format!("{}{}", c, c));
        }
        let vocab = IdiomVocab::new(idioms);
        let lexicon = Lexicon::from_reader(LEXICON.as_bytes()).unwrap();
        Arc::new(DatasetResources::new(vocab, &lexicon, Box::new(test_tokenizer())).unwrap())
    }

    fn instance(tag: &str, idiom: usize, options: Vec<usize>) -> Instance {
        // 他 们 [MASK] ， 他 们 。
        Instance {
            tag: tag.to_string(),
            input_ids: vec![5, 6, 4, 11, 5, 6, 18],
            position: 2,
            idiom,
            target: -100,
            options,
        }
    }

    pub(crate) fn write_test_store(dir: &Path, split: Split) {
        let mut writer = StoreWriter::create(dir).unwrap();
        writer
            .push(&instance("#idiom000000#", 0, (0..7).collect()))
            .unwrap();
        writer.push(&instance("#idiom000001#", 1, vec![])).unwrap();
        writer.push(&instance("#idiom000020#", 2, vec![])).unwrap();
        writer.push(&instance("#idiom000021#", 7, vec![])).unwrap();
        writer.push(&instance("#idiom000040#", 0, vec![])).unwrap();
        writer.finish().unwrap();

        let labelled: FnvHashSet<usize> = [0, 1, 7].iter().copied().collect();
        let unlabelled: FnvHashSet<usize> = [2].iter().copied().collect();
        write_id_list(dir.join(split.labelled_file()), &labelled).unwrap();
        write_id_list(dir.join(UNLABELLED_FILE), &unlabelled).unwrap();
    }

    fn builder(variant: DatasetVariant) -> DatasetBuilder {
        DatasetBuilder::new(test_resources(), variant, 8, 7).unwrap()
    }

    #[test]
    fn allowed_instances_and_candidates() {
        let dir = scratch_dir("dataset-train");
        write_test_store(&dir, Split::Train);

        let labelled_only = builder(DatasetVariant::default())
            .build(Split::Train, &dir, None)
            .unwrap();
        assert_eq!(labelled_only.len(), 3);
        assert_eq!(labelled_only.candidates().ids(), &[0, 1]);
        assert_eq!(labelled_only.qid(2), "#idiom000040#");

        let variant = DatasetVariant {
            use_unlabeled: true,
            ..DatasetVariant::default()
        };
        let with_unlabelled = builder(variant).build(Split::Train, &dir, None).unwrap();
        assert_eq!(with_unlabelled.len(), 4);
        assert_eq!(with_unlabelled.candidates().ids(), &[0, 1, 2]);
    }

    #[test]
    fn reverse_index_must_name_stored_instances() {
        let dir = scratch_dir("dataset-dangling");
        write_test_store(&dir, Split::Train);
        std::fs::write(
            dir.join(crate::store::REVERSE_INDEX_FILE),
            r##"{"0": ["#idiom000000#", "#idiom009999#"]}"##,
        )
        .unwrap();

        let err = builder(DatasetVariant::default())
            .build(Split::Train, &dir, None)
            .err().unwrap();
        assert!(format!("{}", err).contains("#idiom009999#"));
    }

    #[test]
    fn val_split_reuses_candidates() {
        let dir = scratch_dir("dataset-val");
        write_test_store(&dir, Split::Val);

        let variant = DatasetVariant {
            use_unlabeled: true,
            ..DatasetVariant::default()
        };
        assert!(builder(variant).build(Split::Val, &dir, None).is_err());

        let candidates = Arc::new(EnlargedCandidates::new(vec![1, 2]));
        let val = builder(variant)
            .build(Split::Val, &dir, Some(candidates))
            .unwrap();
        // Unlabelled idioms are only used for training.
        assert_eq!(val.len(), 3);

        let mut rng = seeded_rng(1, 0);
        let example = val.get(0, &mut rng);
        assert_eq!(example.target.to_row(), [IGNORE_INDEX, 2, 7, 2, 5]);
        assert_eq!(example.options, (0..7).collect::<Vec<_>>());

        let example = val.get(1, &mut rng);
        assert_eq!(example.target.to_row(), [0, 1, 3, 1, 3]);
        assert_eq!(example.options.len(), N_OPTIONS);
        assert!(example.options.contains(&1));
        // [CLS] 他 们 画 蛇 添 足 ， 他 们 [SEP]
        assert_eq!(
            example.assembled.channels[0].input_ids,
            vec![2, 5, 6, 12, 13, 14, 15, 11, 5, 6, 3]
        );
        assert_eq!(example.assembled.channels[0].span_start, 3);

        let answers = val.sentiment_answers();
        assert_eq!(answers.len(), 3);
        assert_eq!(answers["#idiom000001#"], 1);
    }

    #[test]
    fn class_weights_from_counters() {
        let dir = scratch_dir("dataset-weights");
        write_test_store(&dir, Split::Train);
        let train = builder(DatasetVariant::default())
            .build(Split::Train, &dir, None)
            .unwrap();

        let sentiment = train.sentiment_weights();
        assert_eq!(sentiment.to_vec(), vec![0., 0.5, 1., 0.]);
        assert_eq!(train.fine_emotion_weights().len(), 21);
    }

    #[test]
    fn masked_examples_have_two_channels() {
        let dir = scratch_dir("dataset-masked");
        write_test_store(&dir, Split::Train);
        let variant = DatasetVariant {
            use_context: false,
            masked: true,
            use_unlabeled: false,
        };
        let train = builder(variant).build(Split::Train, &dir, None).unwrap();
        let example = train.get(0, &mut seeded_rng(0, 0));
        assert_eq!(example.assembled.channels.len(), 2);
        assert_eq!(example.assembled.channels[1].span_start, 3);
        assert_eq!(example.assembled.channels[0].span_start, 1);
    }

    #[test]
    fn reverse_index_filter() {
        let reverse_index = btreemap! {
            0 => vec!["a".to_string()],
            2 => vec!["b".to_string()],
            9 => vec!["c".to_string()],
        };
        let labelled: FnvHashSet<usize> = [0, 9].iter().copied().collect();
        let unlabelled: FnvHashSet<usize> = [2].iter().copied().collect();

        let filtered = allowed_reverse_index(reverse_index.clone(), 5, &labelled, None);
        assert_eq!(filtered.keys().copied().collect::<Vec<_>>(), vec![0]);

        let filtered = allowed_reverse_index(reverse_index, 5, &labelled, Some(&unlabelled));
        assert_eq!(filtered.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
    }
}
