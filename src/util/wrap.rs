/// Word-wrap `text` to `width` columns. Existing newlines are kept; words
/// longer than the width are hard-broken.
pub fn wrap_text(text: &str, width: usize) -> String {
    let width = width.max(1);
    let mut out = String::with_capacity(text.len() + 16);
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        wrap_line(line, width, &mut out);
    }
    out
}

fn wrap_line(line: &str, width: usize, out: &mut String) {
    let mut col = 0usize;
    for word in line.split_whitespace() {
        let wlen = word.chars().count();
        if col > 0 && col + 1 + wlen > width {
            out.push('\n');
            col = 0;
        } else if col > 0 {
            out.push(' ');
            col += 1;
        }
        if wlen <= width {
            out.push_str(word);
            col += wlen;
            continue;
        }
        // Hard-break an overlong word
        for ch in word.chars() {
            if col >= width {
                out.push('\n');
                col = 0;
            }
            out.push(ch);
            col += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_at_word_boundaries() {
        let s = wrap_text("the quick brown fox jumps over the lazy dog", 15);
        for line in s.lines() {
            assert!(line.chars().count() <= 15, "line too long: {line:?}");
        }
        assert_eq!(s.replace('\n', " "), "the quick brown fox jumps over the lazy dog");
    }

    #[test]
    fn keeps_existing_newlines() {
        assert_eq!(wrap_text("a\nb", 80), "a\nb");
    }

    #[test]
    fn hard_breaks_long_words() {
        let s = wrap_text("abcdefghij", 4);
        assert_eq!(s, "abcd\nefgh\nij");
    }
}
