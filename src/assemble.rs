use crate::config::DatasetVariant;
use crate::tokenizer::SpecialIds;

/// One encoder input sequence of an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Channel {
    pub input_ids: Vec<u32>,
    pub token_type_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,

    /// Offset of the first idiom token in `input_ids`.
    pub span_start: usize,
}

impl Channel {
    fn new(input_ids: Vec<u32>, attention_mask: Vec<u32>, span_start: usize) -> Self {
        assert_eq!(input_ids.len(), attention_mask.len());
        Channel {
            token_type_ids: vec![0; input_ids.len()],
            input_ids,
            attention_mask,
            span_start,
        }
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Assembled encoder inputs of an instance.
///
/// The first channel shows the idiom, the optional second channel hides
/// the idiom behind mask tokens. Both spans have the same length.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Assembled {
    pub channels: Vec<Channel>,
    pub span_len: usize,
}

fn with_span(cls: u32, prefix: &[u32], span: &[u32], suffix: &[u32], sep: u32) -> Vec<u32> {
    let mut ids = Vec::with_capacity(prefix.len() + span.len() + suffix.len() + 2);
    ids.push(cls);
    ids.extend_from_slice(prefix);
    ids.extend_from_slice(span);
    ids.extend_from_slice(suffix);
    ids.push(sep);
    ids
}

/// Assemble the encoder inputs from a windowed context.
///
/// `context` is the windowed token slice with exactly one mask token
/// standing in for the idiom, `idiom_tokens` the tokenization of the
/// idiom.
///
/// Panics when the context does not contain the mask token or when the
/// assembled length exceeds `max_txt_len + idiom_tokens.len()`.
pub fn assemble(
    context: &[u32],
    idiom_tokens: &[u32],
    special: SpecialIds,
    variant: DatasetVariant,
    max_txt_len: usize,
) -> Assembled {
    assert!(!idiom_tokens.is_empty(), "Idiom without tokens");

    let idiom_start = context
        .iter()
        .position(|&id| id == special.mask)
        .expect("Windowed context does not contain the mask token");
    let prefix = &context[..idiom_start];
    let suffix = &context[idiom_start + 1..];
    let span_len = idiom_tokens.len();
    let max_len = max_txt_len + span_len;

    let literal_ids = if variant.use_context {
        with_span(special.cls, prefix, idiom_tokens, suffix, special.sep)
    } else {
        with_span(special.cls, &[], idiom_tokens, &[], special.sep)
    };
    let literal_start = if variant.use_context {
        idiom_start + 1
    } else {
        1
    };

    let channels = if variant.masked {
        let masked_span = vec![special.mask; span_len];
        let masked_ids = with_span(special.cls, prefix, &masked_span, suffix, special.sep);

        let literal_len = literal_ids.len();
        assert!(
            literal_len <= masked_ids.len(),
            "Literal channel is longer than the masked channel"
        );
        let mut literal_ids = literal_ids;
        literal_ids.resize(masked_ids.len(), special.pad);
        let mut literal_mask = vec![1; literal_len];
        literal_mask.resize(masked_ids.len(), 0);

        let masked_mask = vec![1; masked_ids.len()];
        vec![
            Channel::new(literal_ids, literal_mask, literal_start),
            Channel::new(masked_ids, masked_mask, idiom_start + 1),
        ]
    } else {
        let mask = vec![1; literal_ids.len()];
        vec![Channel::new(literal_ids, mask, literal_start)]
    };

    for channel in &channels {
        assert!(
            channel.len() <= max_len,
            "Assembled length {} exceeds {}",
            channel.len(),
            max_len
        );
        assert!(channel.span_start + span_len <= channel.len());
    }

    Assembled { channels, span_len }
}

#[cfg(test)]
mod tests {
    use super::assemble;
    use crate::config::DatasetVariant;
    use crate::tokenizer::SpecialIds;
    use crate::window::Window;

    const SPECIAL: SpecialIds = SpecialIds {
        cls: 101,
        sep: 102,
        mask: 103,
        pad: 0,
    };

    fn variant(use_context: bool, masked: bool) -> DatasetVariant {
        DatasetVariant {
            use_context,
            masked,
            use_unlabeled: false,
        }
    }

    #[test]
    fn visible_idiom_in_context() {
        let assembled = assemble(&[5, 6, 103, 7], &[40, 41, 42], SPECIAL, variant(true, false), 8);
        assert_eq!(assembled.span_len, 3);
        assert_eq!(assembled.channels.len(), 1);

        let channel = &assembled.channels[0];
        assert_eq!(channel.input_ids, vec![101, 5, 6, 40, 41, 42, 7, 102]);
        assert_eq!(channel.span_start, 3);
        assert_eq!(channel.token_type_ids, vec![0; 8]);
        assert_eq!(channel.attention_mask, vec![1; 8]);
    }

    #[test]
    fn idiom_without_context() {
        let assembled = assemble(&[5, 6, 103, 7], &[40, 41], SPECIAL, variant(false, false), 8);
        let channel = &assembled.channels[0];
        assert_eq!(channel.input_ids, vec![101, 40, 41, 102]);
        assert_eq!(channel.span_start, 1);
    }

    #[test]
    fn masked_pair_in_context() {
        let assembled = assemble(&[5, 103, 7, 8], &[40, 41], SPECIAL, variant(true, true), 8);
        assert_eq!(assembled.channels.len(), 2);

        let literal = &assembled.channels[0];
        let masked = &assembled.channels[1];
        assert_eq!(literal.input_ids, vec![101, 5, 40, 41, 7, 8, 102]);
        assert_eq!(masked.input_ids, vec![101, 5, 103, 103, 7, 8, 102]);
        assert_eq!((literal.span_start, masked.span_start), (2, 2));
        assert_eq!(literal.attention_mask, vec![1; 7]);
        assert_eq!(masked.attention_mask, vec![1; 7]);
    }

    #[test]
    fn masked_pair_without_context_is_padded() {
        let assembled = assemble(&[5, 6, 103, 7], &[40, 41], SPECIAL, variant(false, true), 8);

        let literal = &assembled.channels[0];
        let masked = &assembled.channels[1];
        assert_eq!(masked.input_ids, vec![101, 5, 6, 103, 103, 7, 102]);
        assert_eq!(literal.input_ids, vec![101, 40, 41, 102, 0, 0, 0]);
        assert_eq!(literal.attention_mask, vec![1, 1, 1, 1, 0, 0, 0]);
        assert_eq!(masked.attention_mask, vec![1; 7]);
        assert_eq!((literal.span_start, masked.span_start), (1, 3));
        assert_eq!(literal.token_type_ids, vec![0; 7]);
    }

    #[test]
    fn assembled_length_is_bounded() {
        let max_txt_len = 10;
        for len in 1..30 {
            for position in 0..len {
                let mut tokens: Vec<u32> = (0..len as u32).map(|t| t + 1000).collect();
                tokens[position] = SPECIAL.mask;
                let window = Window::around(len, position, max_txt_len);
                for idiom_len in 1..6 {
                    let idiom: Vec<u32> = (0..idiom_len).map(|t| t + 40).collect();
                    for &(use_context, masked) in
                        &[(true, false), (false, false), (true, true), (false, true)]
                    {
                        let assembled = assemble(
                            window.slice(&tokens),
                            &idiom,
                            SPECIAL,
                            variant(use_context, masked),
                            max_txt_len,
                        );
                        for channel in &assembled.channels {
                            assert!(channel.len() <= max_txt_len + idiom_len as usize);
                            let span = &channel.input_ids
                                [channel.span_start..channel.span_start + idiom_len as usize];
                            assert!(span == &idiom[..] || span.iter().all(|&t| t == SPECIAL.mask));
                        }
                    }
                }
            }
        }
    }

    #[test]
    #[should_panic]
    fn missing_mask_token() {
        assemble(&[5, 6, 7], &[40], SPECIAL, variant(true, false), 8);
    }
}
