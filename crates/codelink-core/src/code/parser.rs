//! Text G-code parsing.
//!
//! Turns a single input line into zero or more [`Code`] commands. A line may
//! chain several codes (`G53 G10`), carry a trailing comment, or consist of
//! a comment only.

use crate::channel::CodeChannel;
use crate::error::{Error, Result};

use super::{Code, CodeFlags, CodeParameter, CodeType, ParameterValue};

/// Parse one line of G-code into codes for the given channel.
///
/// `G53` does not produce a code of its own; it sets
/// [`CodeFlags::ENFORCE_ABSOLUTE_POSITION`] on the codes that follow it on
/// the same line. The last code of the line is tagged
/// [`CodeFlags::IS_LAST_CODE`].
pub fn parse_line(channel: CodeChannel, line: &str) -> Result<Vec<Code>> {
    let mut parser = Parser {
        chars: line.chars().peekable(),
        channel,
    };
    parser.run()
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    channel: CodeChannel,
}

impl Parser<'_> {
    fn run(&mut self) -> Result<Vec<Code>> {
        let mut codes: Vec<Code> = Vec::new();
        let mut enforce_absolute = false;

        self.skip_whitespace();
        self.skip_line_number();

        loop {
            self.skip_whitespace();
            let Some(&ch) = self.chars.peek() else { break };

            if ch == ';' {
                self.chars.next();
                let comment: String = self.chars.by_ref().collect();
                let comment = comment.trim().to_string();
                match codes.last_mut() {
                    Some(code) => code.comment = Some(comment),
                    None => {
                        let mut code = Code::new(self.channel, CodeType::Comment, None);
                        code.comment = Some(comment);
                        codes.push(code);
                    }
                }
                break;
            }

            if ch == '(' {
                self.skip_inline_comment()?;
                continue;
            }

            match ch.to_ascii_uppercase() {
                letter @ ('G' | 'M' | 'T') if self.starts_code() => {
                    self.chars.next();
                    let major = self.parse_int()?;
                    let minor = if self.chars.peek() == Some(&'.') {
                        self.chars.next();
                        Some(self.parse_int()?)
                    } else {
                        None
                    };

                    if letter == 'G' && major == 53 && minor.is_none() {
                        enforce_absolute = true;
                        continue;
                    }

                    let code_type = match letter {
                        'G' => CodeType::GCode,
                        'M' => CodeType::MCode,
                        _ => CodeType::TCode,
                    };
                    let mut code = Code::new(self.channel, code_type, Some(major));
                    code.minor = minor;
                    if enforce_absolute {
                        code.flags |= CodeFlags::ENFORCE_ABSOLUTE_POSITION;
                    }
                    codes.push(code);
                }
                letter if letter.is_ascii_alphabetic() || letter == '\'' => {
                    // Lowercase parameters may be quoted with a leading tick.
                    let letter = if letter == '\'' {
                        self.chars.next();
                        match self.chars.next() {
                            Some(c) if c.is_ascii_alphabetic() => c.to_ascii_lowercase(),
                            other => {
                                return Err(Error::CodeParse {
                                    message: format!("invalid quoted parameter letter {other:?}"),
                                })
                            }
                        }
                    } else {
                        self.chars.next();
                        ch.to_ascii_uppercase()
                    };

                    let code = codes.last_mut().ok_or_else(|| Error::CodeParse {
                        message: format!("parameter {letter} before any code"),
                    })?;
                    let value = self.parse_value()?;
                    code.parameters.push(CodeParameter::new(letter, value));
                }
                other => {
                    return Err(Error::CodeParse {
                        message: format!("unexpected character {other:?}"),
                    });
                }
            }
        }

        if let Some(last) = codes.last_mut() {
            last.flags |= CodeFlags::IS_LAST_CODE;
        }
        Ok(codes)
    }

    /// A G/M/T letter opens a new code only when a number follows.
    fn starts_code(&mut self) -> bool {
        let mut lookahead = self.chars.clone();
        lookahead.next();
        matches!(lookahead.peek(), Some(c) if c.is_ascii_digit() || *c == '-')
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    /// `N123` line numbers are accepted and dropped.
    fn skip_line_number(&mut self) {
        let mut lookahead = self.chars.clone();
        if matches!(lookahead.next(), Some('N' | 'n'))
            && matches!(lookahead.peek(), Some(c) if c.is_ascii_digit())
        {
            self.chars.next();
            while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit()) {
                self.chars.next();
            }
        }
    }

    fn skip_inline_comment(&mut self) -> Result<()> {
        self.chars.next();
        for ch in self.chars.by_ref() {
            if ch == ')' {
                return Ok(());
            }
        }
        Err(Error::CodeParse {
            message: "unterminated inline comment".into(),
        })
    }

    fn parse_int(&mut self) -> Result<i32> {
        let mut text = String::new();
        if self.chars.peek() == Some(&'-') {
            text.push('-');
            self.chars.next();
        }
        while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit()) {
            text.push(self.chars.next().unwrap());
        }
        text.parse().map_err(|_| Error::CodeParse {
            message: format!("invalid number {text:?}"),
        })
    }

    fn parse_value(&mut self) -> Result<ParameterValue> {
        match self.chars.peek() {
            Some('"') => self.parse_string(),
            Some('{') => self.parse_expression(),
            Some(c) if !c.is_whitespace() && *c != ';' => {
                let mut token = String::new();
                while matches!(self.chars.peek(), Some(c) if !c.is_whitespace() && *c != ';') {
                    token.push(self.chars.next().unwrap());
                }
                Ok(classify_token(&token))
            }
            // Bare parameter letter without a value.
            _ => Ok(ParameterValue::String(String::new())),
        }
    }

    fn parse_string(&mut self) -> Result<ParameterValue> {
        self.chars.next();
        let mut text = String::new();
        loop {
            match self.chars.next() {
                Some('"') => {
                    // A doubled quote is a literal quote.
                    if self.chars.peek() == Some(&'"') {
                        self.chars.next();
                        text.push('"');
                    } else {
                        return Ok(ParameterValue::String(text));
                    }
                }
                Some(ch) => text.push(ch),
                None => {
                    return Err(Error::CodeParse {
                        message: "unterminated string".into(),
                    })
                }
            }
        }
    }

    fn parse_expression(&mut self) -> Result<ParameterValue> {
        let mut text = String::new();
        let mut depth = 0usize;
        for ch in self.chars.by_ref() {
            text.push(ch);
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(ParameterValue::Expression(text));
                    }
                }
                _ => {}
            }
        }
        Err(Error::CodeParse {
            message: "unterminated expression".into(),
        })
    }
}

/// Infer the wire type of a bare value token.
fn classify_token(token: &str) -> ParameterValue {
    if token.contains(':') {
        let parts: Vec<&str> = token.split(':').collect();
        if let Ok(values) = parts.iter().map(|p| p.parse()).collect::<Parsed<i32>>() {
            return ParameterValue::IntArray(values);
        }
        if let Ok(values) = parts.iter().map(|p| p.parse()).collect::<Parsed<u32>>() {
            return ParameterValue::UIntArray(values);
        }
        if let Ok(values) = parts.iter().map(|p| p.parse()).collect::<Parsed<f32>>() {
            return ParameterValue::FloatArray(values);
        }
        return ParameterValue::String(token.to_string());
    }

    if let Ok(value) = token.parse::<i32>() {
        return ParameterValue::Int(value);
    }
    if let Ok(value) = token.parse::<u32>() {
        return ParameterValue::UInt(value);
    }
    if let Ok(value) = token.parse::<f32>() {
        return ParameterValue::Float(value);
    }
    ParameterValue::String(token.to_string())
}

// `Result` in this module is the crate alias, so collect() needs the full type.
type Parsed<T> = std::result::Result<Vec<T>, <T as std::str::FromStr>::Err>;

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Vec<Code> {
        parse_line(CodeChannel::Usb, line).unwrap()
    }

    #[test]
    fn empty_line_yields_nothing() {
        assert!(parse("").is_empty());
        assert!(parse("   ").is_empty());
    }

    #[test]
    fn simple_move() {
        let codes = parse("G1 X4 Y23.5 Z12.2 E12:3.45 J\"test\"");
        assert_eq!(codes.len(), 1);
        let code = &codes[0];
        assert_eq!(code.code_type, CodeType::GCode);
        assert_eq!(code.major, Some(1));
        assert_eq!(code.minor, None);
        assert_eq!(code.parameters.len(), 5);
        assert_eq!(code.parameters[0].value, ParameterValue::Int(4));
        assert_eq!(code.parameters[1].value, ParameterValue::Float(23.5));
        assert_eq!(code.parameters[2].value, ParameterValue::Float(12.2));
        assert_eq!(
            code.parameters[3].value,
            ParameterValue::FloatArray(vec![12.0, 3.45])
        );
        assert_eq!(
            code.parameters[4].value,
            ParameterValue::String("test".into())
        );
        assert!(code.flags.contains(CodeFlags::IS_LAST_CODE));
    }

    #[test]
    fn g53_sets_enforce_flag() {
        let codes = parse("G53 G10");
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].major, Some(10));
        assert!(codes[0]
            .flags
            .contains(CodeFlags::ENFORCE_ABSOLUTE_POSITION | CodeFlags::IS_LAST_CODE));
    }

    #[test]
    fn minor_number() {
        let codes = parse("M122.1");
        assert_eq!(codes[0].major, Some(122));
        assert_eq!(codes[0].minor, Some(1));
    }

    #[test]
    fn negative_tool_number() {
        let codes = parse("T-1");
        assert_eq!(codes[0].code_type, CodeType::TCode);
        assert_eq!(codes[0].major, Some(-1));
    }

    #[test]
    fn chained_codes_share_line() {
        let codes = parse("G90 G21");
        assert_eq!(codes.len(), 2);
        assert!(!codes[0].flags.contains(CodeFlags::IS_LAST_CODE));
        assert!(codes[1].flags.contains(CodeFlags::IS_LAST_CODE));
    }

    #[test]
    fn line_number_is_skipped() {
        let codes = parse("N42 G1 X1");
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].major, Some(1));
    }

    #[test]
    fn comment_only_line() {
        let codes = parse("; homing all axes");
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].code_type, CodeType::Comment);
        assert_eq!(codes[0].comment.as_deref(), Some("homing all axes"));
    }

    #[test]
    fn trailing_comment_attaches_to_code() {
        let codes = parse("G28 ; home");
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].comment.as_deref(), Some("home"));
    }

    #[test]
    fn inline_comment_is_dropped() {
        let codes = parse("G1 (move) X2");
        assert_eq!(codes[0].parameters.len(), 1);
        assert_eq!(codes[0].parameters[0].letter, 'X');
    }

    #[test]
    fn quoted_string_with_escaped_quote() {
        let codes = parse("M98 P\"macros/\"\"test\"\".g\"");
        assert_eq!(
            codes[0].parameters[0].value,
            ParameterValue::String("macros/\"test\".g".into())
        );
    }

    #[test]
    fn expression_parameter() {
        let codes = parse("M118 S{move.axes[0].position}");
        assert_eq!(
            codes[0].parameters[0].value,
            ParameterValue::Expression("{move.axes[0].position}".into())
        );
    }

    #[test]
    fn nested_expression() {
        let codes = parse("M118 S{max(1, {2})}");
        assert_eq!(
            codes[0].parameters[0].value,
            ParameterValue::Expression("{max(1, {2})}".into())
        );
    }

    #[test]
    fn bare_parameter_letter() {
        let codes = parse("M122 P");
        assert_eq!(
            codes[0].parameters[0].value,
            ParameterValue::String(String::new())
        );
    }

    #[test]
    fn uint_overflowing_int() {
        let codes = parse("M409 K3000000000");
        assert_eq!(
            codes[0].parameters[0].value,
            ParameterValue::UInt(3_000_000_000)
        );
    }

    #[test]
    fn int_array_parameter() {
        let codes = parse("M584 E3:4:5");
        assert_eq!(
            codes[0].parameters[0].value,
            ParameterValue::IntArray(vec![3, 4, 5])
        );
    }

    #[test]
    fn uint_array_parameter() {
        let codes = parse("M409 K3000000000:5");
        assert_eq!(
            codes[0].parameters[0].value,
            ParameterValue::UIntArray(vec![3_000_000_000, 5])
        );
    }

    #[test]
    fn parameter_before_code_is_an_error() {
        assert!(parse_line(CodeChannel::Usb, "X10 G1").is_err());
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(parse_line(CodeChannel::Usb, "M98 P\"oops").is_err());
    }

    #[test]
    fn unterminated_expression_is_an_error() {
        assert!(parse_line(CodeChannel::Usb, "M118 S{1 + 2").is_err());
    }
}
