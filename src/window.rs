/// Truncation window `[start, end)` around a masked idiom.
///
/// The window leaves room for the two boundary markers that are added
/// during assembly, so `end - start <= max_txt_len - 2` always holds.
/// `end` may exceed the sequence length by one, slicing clamps it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

impl Window {
    /// Compute the window for a mask at `position` in a sequence of `len`
    /// tokens.
    ///
    /// Context is kept on both sides of the mask where possible. When the
    /// mask is close to the start of the sequence the tail is cut, when it
    /// is close to the end the head is cut.
    ///
    /// Panics when `position` is not inside the sequence or when the token
    /// budget is too small to hold the boundary markers and the mask.
    pub fn around(len: usize, position: usize, max_txt_len: usize) -> Self {
        assert!(
            max_txt_len >= 4,
            "Maximum text length {} cannot hold boundary markers and a span",
            max_txt_len
        );
        assert!(
            position < len,
            "Mask position {} outside sequence of length {}",
            position,
            len
        );

        let budget = max_txt_len - 2;
        let half = max_txt_len / 2;

        let (start, end) = if position < half {
            (0, (len + 1).min(budget))
        } else if len - position < half {
            (len.saturating_sub(budget), len)
        } else {
            (position - (half - 2), position + half)
        };

        assert!(
            end - start <= budget,
            "Window [{}, {}) exceeds the token budget {}",
            start,
            end,
            budget
        );

        Window { start, end }
    }

    /// Number of tokens in the window, before clamping.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The windowed part of `tokens`.
    pub fn slice<'a, T>(&self, tokens: &'a [T]) -> &'a [T] {
        &tokens[self.start..self.end.min(tokens.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::Window;

    #[test]
    fn tail_cut() {
        assert_eq!(Window::around(10, 2, 8), Window { start: 0, end: 6 });
    }

    #[test]
    fn head_cut() {
        assert_eq!(Window::around(10, 8, 8), Window { start: 4, end: 10 });
    }

    #[test]
    fn symmetric_cut() {
        // half = 4, L - position = 5
        assert_eq!(Window::around(10, 5, 8), Window { start: 3, end: 9 });
    }

    #[test]
    fn short_sequence_keeps_extra_slot() {
        let window = Window::around(3, 1, 16);
        assert_eq!(window, Window { start: 0, end: 4 });
        assert_eq!(window.slice(&[1, 2, 3]), &[1, 2, 3]);
    }

    #[test]
    fn windows_contain_mask_and_respect_budget() {
        for max_txt_len in 4..24 {
            for len in 1..40 {
                for position in 0..len {
                    let window = Window::around(len, position, max_txt_len);
                    assert!(window.start <= position);
                    assert!(position < window.end);
                    assert!(window.end <= len + 1);
                    assert!(window.len() <= max_txt_len - 2);

                    let tokens: Vec<usize> = (0..len).collect();
                    let slice = window.slice(&tokens);
                    assert!(slice.contains(&position));
                }
            }
        }
    }

    #[test]
    #[should_panic]
    fn position_outside_sequence() {
        Window::around(4, 4, 8);
    }

    #[test]
    #[should_panic]
    fn budget_too_small() {
        Window::around(4, 1, 3);
    }
}
