use serde::Serialize;
use std::io::{self, Write};

/// JSON formatter reproducing Python's `json.dumps` defaults: `", "` and `": "`
/// separators, ASCII-only output (`\uXXXX` escapes, lowercase hex) and floats
/// laid out like `repr(float)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonJsonFormatter;

impl serde_json::ser::Formatter for PythonJsonFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        writer.write_all(b": ")
    }

    fn write_f64<W>(&mut self, writer: &mut W, value: f64) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        writer.write_all(python_float_repr(value).as_bytes())
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

/// Shortest round-trip digits, positional for decimal exponents in `-4..16`,
/// otherwise `d.ddde±XX` with a signed exponent of at least two digits.
/// Only called for finite values; serde_json writes `null` for the rest.
fn python_float_repr(value: f64) -> String {
    let sign = if value.is_sign_negative() { "-" } else { "" };
    let scientific = format!("{:e}", value.abs());
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    if !(-4..16).contains(&exponent) {
        let (head, tail) = digits.split_at(1);
        let point = if tail.is_empty() { "" } else { "." };
        let exponent_sign = if exponent < 0 { '-' } else { '+' };
        return format!(
            "{}{}{}{}e{}{:02}",
            sign,
            head,
            point,
            tail,
            exponent_sign,
            exponent.unsigned_abs()
        );
    }

    if exponent < 0 {
        let zeros = "0".repeat((-exponent - 1) as usize);
        return format!("{}0.{}{}", sign, zeros, digits);
    }

    let integer_len = exponent as usize + 1;
    if digits.len() <= integer_len {
        let zeros = "0".repeat(integer_len - digits.len());
        format!("{}{}{}.0", sign, digits, zeros)
    } else {
        let (integer, fraction) = digits.split_at(integer_len);
        format!("{}{}.{}", sign, integer, fraction)
    }
}

pub fn to_python_json<T>(value: &T) -> serde_json::Result<Vec<u8>>
where
    T: ?Sized + Serialize,
{
    let mut buf = Vec::with_capacity(128);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, PythonJsonFormatter);
    value.serialize(&mut serializer)?;
    Ok(buf)
}

pub fn to_python_json_string<T>(value: &T) -> serde_json::Result<String>
where
    T: ?Sized + Serialize,
{
    let bytes = to_python_json(value)?;
    // The formatter only ever emits ASCII.
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_separators_match_python() {
        let value = json!({"a": [1.5, 2.0], "b": "x"});
        let out = to_python_json_string(&value).unwrap();
        assert_eq!(out, r#"{"a": [1.5, 2.0], "b": "x"}"#);
    }

    #[test]
    fn test_non_ascii_is_escaped() {
        let out = to_python_json_string("café ☃ 𝄞").unwrap();
        assert_eq!(out, r#""caf\u00e9 \u2603 \ud834\udd1e""#);
    }

    #[test]
    fn test_float_array_layout() {
        let out = to_python_json_string(&vec![0.1726846298, 3.453692596]).unwrap();
        assert_eq!(out, "[0.1726846298, 3.453692596]");
    }

    #[test]
    fn test_float_exponents_match_python_repr() {
        let values = vec![
            1e-7,
            7.142857142983239e-7,
            1.5e-5,
            0.0001,
            1e15,
            1e16,
            1.2345e100,
            -2.5e-10,
            123456.789,
            1726846298000.0,
            0.0,
            -0.0,
        ];
        let out = to_python_json_string(&values).unwrap();
        assert_eq!(
            out,
            "[1e-07, 7.142857142983239e-07, 1.5e-05, 0.0001, 1000000000000000.0, 1e+16, \
             1.2345e+100, -2.5e-10, 123456.789, 1726846298000.0, 0.0, -0.0]"
        );
    }
}
