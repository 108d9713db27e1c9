use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, ensure, Result};
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::bert::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::{AddedToken, Model, NormalizerWrapper, PreTokenizerWrapper};

pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";
pub const MASK_TOKEN: &str = "[MASK]";
pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";

const SPECIAL_TOKENS: &[&str] = &[CLS_TOKEN, SEP_TOKEN, MASK_TOKEN, PAD_TOKEN, UNK_TOKEN];

/// Ids of the special tokens used during assembly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpecialIds {
    pub cls: u32,
    pub sep: u32,
    pub mask: u32,
    pub pad: u32,
}

/// Text to token ids.
pub trait Tokenizer: Send + Sync {
    /// Split text into tokens. Special tokens in the text are kept whole.
    fn tokenize(&self, text: &str) -> Result<Vec<String>>;

    /// Map tokens to ids, unknown tokens map to the id of `[UNK]`.
    fn convert_tokens_to_ids(&self, tokens: &[String]) -> Vec<u32>;

    fn special_ids(&self) -> SpecialIds;

    fn vocab_size(&self) -> usize;
}

fn require_id(lookup: impl Fn(&str) -> Option<u32>, token: &str) -> Result<u32> {
    lookup(token).ok_or_else(|| anyhow!("Tokenizer has no id for {}", token))
}

fn special_ids_from(lookup: impl Fn(&str) -> Option<u32> + Copy) -> Result<SpecialIds> {
    Ok(SpecialIds {
        cls: require_id(lookup, CLS_TOKEN)?,
        sep: require_id(lookup, SEP_TOKEN)?,
        mask: require_id(lookup, MASK_TOKEN)?,
        pad: require_id(lookup, PAD_TOKEN)?,
    })
}

/// HuggingFace tokenizer, read from a `tokenizer.json` or assembled as a
/// BERT word piece tokenizer over a `vocab.txt`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    special: SpecialIds,
    unk: u32,
}

impl HfTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|err| anyhow!("Cannot load tokenizer {}: {}", path.display(), err))?;
        Self::new(inner)
    }

    /// Read a BERT `vocab.txt`, one word piece per line.
    pub fn from_vocab_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Token vocabulary path {} is not UTF-8", path.display()))?;
        let wordpiece = WordPiece::from_file(path_str)
            .unk_token(UNK_TOKEN.to_owned())
            .build()
            .map_err(|err| anyhow!("Cannot read token vocabulary {}: {}", path.display(), err))?;
        Self::bert(wordpiece)
    }

    /// Construct a BERT word piece tokenizer from the tokens of a vocabulary,
    /// the id of a token is its position.
    pub fn from_vocab(tokens: &[&str]) -> Result<Self> {
        let vocab: HashMap<String, u32> = tokens
            .iter()
            .enumerate()
            .map(|(idx, &token)| (token.to_owned(), idx as u32))
            .collect();
        let wordpiece = WordPiece::builder()
            .vocab(vocab)
            .unk_token(UNK_TOKEN.to_owned())
            .build()
            .map_err(|err| anyhow!("Cannot construct word piece model: {}", err))?;
        Self::bert(wordpiece)
    }

    /// Lowercasing BERT normalization that isolates CJK characters and
    /// punctuation. Special tokens in the text are kept whole.
    fn bert(wordpiece: WordPiece) -> Result<Self> {
        for &token in SPECIAL_TOKENS {
            ensure!(
                wordpiece.token_to_id(token).is_some(),
                "Token vocabulary has no {}",
                token
            );
        }

        let mut inner = tokenizers::Tokenizer::new(wordpiece);
        inner.with_normalizer(NormalizerWrapper::from(BertNormalizer::new(
            true, true, None, true,
        )));
        inner.with_pre_tokenizer(PreTokenizerWrapper::from(BertPreTokenizer));
        let special_tokens: Vec<AddedToken> = SPECIAL_TOKENS
            .iter()
            .map(|&token| AddedToken::from(token, true))
            .collect();
        inner.add_special_tokens(&special_tokens);
        Self::new(inner)
    }

    fn new(inner: tokenizers::Tokenizer) -> Result<Self> {
        let special = special_ids_from(|token| inner.token_to_id(token))?;
        let unk = require_id(|token| inner.token_to_id(token), UNK_TOKEN)?;
        Ok(HfTokenizer {
            inner,
            special,
            unk,
        })
    }
}

impl Tokenizer for HfTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|err| anyhow!("Cannot tokenize '{}': {}", text, err))?;
        Ok(encoding.get_tokens().to_vec())
    }

    fn convert_tokens_to_ids(&self, tokens: &[String]) -> Vec<u32> {
        tokens
            .iter()
            .map(|token| self.inner.token_to_id(token).unwrap_or(self.unk))
            .collect()
    }

    fn special_ids(&self) -> SpecialIds {
        self.special
    }

    fn vocab_size(&self) -> usize {
        self.inner
            .get_vocab(true)
            .values()
            .max()
            .map(|&id| id as usize + 1)
            .unwrap_or(0)
    }
}

/// Load a tokenizer, `.json` files are HuggingFace tokenizers, anything
/// else is read as a `vocab.txt`.
pub fn load_tokenizer(path: impl AsRef<Path>) -> Result<Box<dyn Tokenizer>> {
    let path = path.as_ref();
    if path.extension().map(|ext| ext == "json").unwrap_or(false) {
        Ok(Box::new(HfTokenizer::from_file(path)?))
    } else {
        Ok(Box::new(HfTokenizer::from_vocab_file(path)?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;

    use super::{load_tokenizer, HfTokenizer, SpecialIds, Tokenizer};
    use crate::store::tests::scratch_dir;

    static TOKENS: &[&str] = &[
        "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "他", "们", "守", "株", "待", "兔", "，", "画",
        "蛇", "添", "足", "bert", "##s", "。",
    ];

    pub(crate) fn test_tokenizer() -> HfTokenizer {
        HfTokenizer::from_vocab(TOKENS).unwrap()
    }

    #[test]
    fn special_ids_from_vocab() {
        let tokenizer = test_tokenizer();
        assert_eq!(
            tokenizer.special_ids(),
            SpecialIds {
                cls: 2,
                sep: 3,
                mask: 4,
                pad: 0
            }
        );
        assert_eq!(tokenizer.vocab_size(), 19);
    }

    #[test]
    fn vocab_file_tokenizes_like_vocab() {
        let dir = scratch_dir("tokenizer-vocab");
        let path = dir.join("vocab.txt");
        fs::write(&path, TOKENS.join("\n")).unwrap();
        let from_file = load_tokenizer(&path).unwrap();
        let tokenizer = test_tokenizer();

        for text in &["他们守株待兔，[MASK]。", "BERTs [UNK] 龙 xyz"] {
            let tokens = tokenizer.tokenize(text).unwrap();
            assert_eq!(from_file.tokenize(text).unwrap(), tokens);
            assert_eq!(
                from_file.convert_tokens_to_ids(&tokens),
                tokenizer.convert_tokens_to_ids(&tokens)
            );
        }
        assert_eq!(from_file.special_ids(), tokenizer.special_ids());
        assert_eq!(from_file.vocab_size(), 19);

        let tokens = tokenizer.tokenize("他们守株待兔，[MASK]。").unwrap();
        assert_eq!(
            tokenizer.convert_tokens_to_ids(&tokens),
            vec![5, 6, 7, 8, 9, 10, 11, 4, 18]
        );
        assert_eq!(
            tokenizer.tokenize("BERTs [UNK] 龙 xyz").unwrap(),
            vec!["bert", "##s", "[UNK]", "[UNK]", "[UNK]"]
        );
    }

    #[test]
    fn missing_special_tokens() {
        assert!(HfTokenizer::from_vocab(&["[CLS]", "[SEP]", "[UNK]"]).is_err());
    }
}
