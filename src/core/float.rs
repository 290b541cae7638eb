//! Purpose: Canonical text for floating-point literals found in dump lines.
//! Exports: `format_significant`, `canonicalize_floats`, `MAX_PRECISION`.
//! Role: Removes engine/platform differences in float-to-text rounding.
//! Invariants: Quoted strings, quoted identifiers, integers and hex literals pass through untouched.
//! Invariants: Non-finite values (e.g. `1e999`) pass through untouched.
//! Invariants: For precision <= 15 the rewrite is a fixed point.

pub const MAX_PRECISION: u8 = 17;

/// `%g`-style rendering with `digits` significant digits that always stays a REAL literal.
pub fn format_significant(value: f64, digits: u8) -> String {
    let digits = usize::from(digits.clamp(1, MAX_PRECISION));
    if value == 0.0 {
        return "0.0".to_string();
    }
    let sci = format!("{:.*e}", digits - 1, value.abs());
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let Ok(exp) = exp.parse::<i32>() else {
        return sci;
    };
    let sign = if value.is_sign_negative() { "-" } else { "" };
    let significand: String = mantissa.chars().filter(|ch| ch.is_ascii_digit()).collect();

    if exp < -4 || exp >= digits as i32 {
        let mantissa = trim_fraction(mantissa);
        let exp_sign = if exp < 0 { '-' } else { '+' };
        return format!("{sign}{mantissa}e{exp_sign}{:02}", exp.unsigned_abs());
    }

    if exp >= 0 {
        let int_len = exp as usize + 1;
        let (int_part, frac_part) = significand.split_at(int_len.min(significand.len()));
        let frac_part = frac_part.trim_end_matches('0');
        if frac_part.is_empty() {
            format!("{sign}{int_part}.0")
        } else {
            format!("{sign}{int_part}.{frac_part}")
        }
    } else {
        let zeros = "0".repeat(exp.unsigned_abs() as usize - 1);
        let frac_part = significand.trim_end_matches('0');
        format!("{sign}0.{zeros}{frac_part}")
    }
}

fn trim_fraction(mantissa: &str) -> &str {
    if !mantissa.contains('.') {
        return mantissa;
    }
    mantissa.trim_end_matches('0').trim_end_matches('.')
}

/// Rewrite every float literal in `line` outside quotes, appending the result to `out`.
pub fn canonicalize_floats(line: &[u8], digits: u8, out: &mut Vec<u8>) {
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < line.len() {
        let byte = line[i];
        if let Some(close) = quote {
            out.push(byte);
            if byte == close {
                quote = None;
            }
            i += 1;
            continue;
        }
        match byte {
            b'\'' | b'"' | b'`' => {
                quote = Some(byte);
                out.push(byte);
                i += 1;
            }
            b'[' => {
                quote = Some(b']');
                out.push(byte);
                i += 1;
            }
            _ if is_word_byte(byte) => {
                let end = scan_word(line, i);
                let word = &line[i..end];
                match rewrite_literal(word, digits) {
                    Some(text) => out.extend_from_slice(text.as_bytes()),
                    None => out.extend_from_slice(word),
                }
                i = end;
            }
            _ => {
                out.push(byte);
                i += 1;
            }
        }
    }
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'$' | b'.') || byte >= 0x80
}

fn scan_word(line: &[u8], start: usize) -> usize {
    let numeric = line[start].is_ascii_digit() || line[start] == b'.';
    let mut end = start;
    while end < line.len() {
        let byte = line[end];
        if is_word_byte(byte) {
            end += 1;
        } else if numeric
            && matches!(byte, b'+' | b'-')
            && end > start
            && matches!(line[end - 1], b'e' | b'E')
        {
            end += 1;
        } else {
            break;
        }
    }
    end
}

fn rewrite_literal(word: &[u8], digits: u8) -> Option<String> {
    if !is_float_literal(word) {
        return None;
    }
    let text = std::str::from_utf8(word).ok()?;
    let value: f64 = text.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(format_significant(value, digits))
}

/// `digits [. digits] [e [+-] digits]` with a dot or an exponent present.
fn is_float_literal(word: &[u8]) -> bool {
    let mut i = 0;
    let mut mantissa_digits = 0;
    while i < word.len() && word[i].is_ascii_digit() {
        i += 1;
        mantissa_digits += 1;
    }
    let mut has_dot = false;
    if i < word.len() && word[i] == b'.' {
        has_dot = true;
        i += 1;
        while i < word.len() && word[i].is_ascii_digit() {
            i += 1;
            mantissa_digits += 1;
        }
    }
    if mantissa_digits == 0 {
        return false;
    }
    let mut has_exp = false;
    if i < word.len() && matches!(word[i], b'e' | b'E') {
        i += 1;
        if i < word.len() && matches!(word[i], b'+' | b'-') {
            i += 1;
        }
        let exp_start = i;
        while i < word.len() && word[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return false;
        }
        has_exp = true;
    }
    i == word.len() && (has_dot || has_exp)
}

#[cfg(test)]
mod tests {
    use super::{canonicalize_floats, format_significant, is_float_literal};

    fn canon(line: &str, digits: u8) -> String {
        let mut out = Vec::new();
        canonicalize_floats(line.as_bytes(), digits, &mut out);
        String::from_utf8(out).expect("utf8")
    }

    #[test]
    fn sum_of_tenths_renders_identically() {
        let value = 0.1_f64 + 0.2_f64;
        assert_eq!(format_significant(value, 15), "0.3");
        for line in [
            "INSERT INTO t VALUES(1,0.30000000000000004);",
            "INSERT INTO t VALUES(1,0.300000000000000044);",
            "INSERT INTO t VALUES(1,3.0e-1);",
        ] {
            assert_eq!(canon(line, 15), "INSERT INTO t VALUES(1,0.3);", "{line}");
        }
    }

    #[test]
    fn format_significant_covers_notation_boundaries() {
        assert_eq!(format_significant(3.0, 15), "3.0");
        assert_eq!(format_significant(1234.5, 15), "1234.5");
        assert_eq!(format_significant(0.0001, 15), "0.0001");
        assert_eq!(format_significant(0.00001, 15), "1e-05");
        assert_eq!(format_significant(1.0e300, 15), "1e+300");
        assert_eq!(format_significant(123456789012345678.0, 15), "1.23456789012346e+17");
        assert_eq!(format_significant(9.99, 2), "10.0");
        assert_eq!(format_significant(-2.5, 15), "-2.5");
        assert_eq!(format_significant(0.0, 15), "0.0");
    }

    #[test]
    fn rewrite_is_a_fixed_point() {
        let lines = [
            "INSERT INTO m VALUES(0.1,2.5e-7,1e+300,3.0,123456.789);",
            "INSERT INTO m VALUES(-0.30000000000000004,1.0E10);",
        ];
        for line in lines {
            let once = canon(line, 15);
            let twice = canon(&once, 15);
            assert_eq!(once, twice, "not idempotent for {line}");
        }
    }

    #[test]
    fn strings_identifiers_and_integers_are_untouched() {
        let line = concat!(
            "INSERT INTO \"t.1\" VALUES(42,'0.30000000000000004',",
            "X'0A1B',[c 2.50],0x1F,t2.col,`1.50`);"
        );
        assert_eq!(canon(line, 3), line);
    }

    #[test]
    fn doubled_quotes_inside_strings_stay_quoted() {
        let line = "INSERT INTO t VALUES('it''s 0.10000',0.10000);";
        assert_eq!(canon(line, 15), "INSERT INTO t VALUES('it''s 0.10000',0.1);");
    }

    #[test]
    fn non_finite_literals_pass_through() {
        let line = "INSERT INTO t VALUES(1e999,-1e999);";
        assert_eq!(canon(line, 15), line);
    }

    #[test]
    fn float_literal_grammar() {
        for ok in ["1.5", ".5", "5.", "1e5", "1E+5", "2.5e-3"] {
            assert!(is_float_literal(ok.as_bytes()), "{ok}");
        }
        for bad in ["15", ".", "e5", "1e", "1.2.3", "0x1F", "1e+", "abc"] {
            assert!(!is_float_literal(bad.as_bytes()), "{bad}");
        }
    }
}
