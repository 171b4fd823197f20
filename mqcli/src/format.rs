use std::fmt::Write as _;
use std::io::{self, Write};

use chrono::{DateTime, Local};

use crate::config::SessionConfig;
use crate::types::Delivery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HexMode {
    Raw,
    Lower,
    Upper,
}

/// Local receive time, captured once per message on first use.
#[derive(Default)]
struct ReceiveTime {
    cached: Option<(DateTime<Local>, u32)>,
}

impl ReceiveTime {
    fn get(&mut self) -> (DateTime<Local>, u32) {
        *self.cached.get_or_insert_with(|| {
            let now = Local::now();
            let ns = now.timestamp_subsec_nanos();
            (now, ns)
        })
    }
}

fn write_payload(out: &mut dyn Write, payload: &[u8], hex: HexMode) -> io::Result<()> {
    match hex {
        HexMode::Raw => out.write_all(payload),
        HexMode::Lower => {
            for b in payload {
                write!(out, "{:02x}", b)?;
            }
            Ok(())
        }
        HexMode::Upper => {
            for b in payload {
                write!(out, "{:02X}", b)?;
            }
            Ok(())
        }
    }
}

// Quote, backslash and C0 controls become \u00XX; every other byte passes
// through unescaped.
fn write_json_payload(out: &mut dyn Write, payload: &[u8]) -> io::Result<()> {
    for &b in payload {
        if b == b'"' || b == b'\\' || b < 32 {
            write!(out, "\\u{:04x}", b)?;
        } else {
            out.write_all(&[b])?;
        }
    }
    Ok(())
}

fn json_print(
    out: &mut dyn Write,
    msg: &Delivery,
    ti: &DateTime<Local>,
    escaped: bool,
) -> io::Result<()> {
    write!(
        out,
        "{{\"tst\":{},\"topic\":\"{}\",\"qos\":{},\"retain\":{},\"payloadlen\":{},",
        ti.timestamp(),
        msg.topic,
        msg.qos.value(),
        msg.retain as u8,
        msg.payload.len()
    )?;
    if msg.qos.value() > 0 {
        write!(out, "\"mid\":{},", msg.mid)?;
    }
    if escaped {
        out.write_all(b"\"payload\":\"")?;
        write_json_payload(out, &msg.payload)?;
        out.write_all(b"\"}")
    } else {
        out.write_all(b"\"payload\":")?;
        write_payload(out, &msg.payload, HexMode::Raw)?;
        out.write_all(b"}")
    }
}

// Unknown directives make chrono's formatter fail mid-write; the output is
// dropped in that case, like strftime returning 0.
fn write_strftime(out: &mut dyn Write, ti: &DateTime<Local>, fmt: &str) -> io::Result<()> {
    let mut buf = String::new();
    if write!(&mut buf, "{}", ti.format(fmt)).is_ok() {
        out.write_all(buf.as_bytes())?;
    }
    Ok(())
}

/// Render one message through the format mini-language. Each escape
/// character consumes exactly one following character; a trailing lone
/// escape character is silently dropped.
fn formatted_print(out: &mut dyn Write, fmt: &str, eol: bool, msg: &Delivery) -> io::Result<()> {
    let mut now = ReceiveTime::default();
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => {
                if let Some(n) = chars.next() {
                    match n {
                        '%' => out.write_all(b"%")?,
                        'I' => {
                            let (ti, _) = now.get();
                            write_strftime(out, &ti, "%FT%T%z")?;
                        }
                        'j' => {
                            let (ti, _) = now.get();
                            json_print(out, msg, &ti, true)?;
                        }
                        'J' => {
                            let (ti, _) = now.get();
                            json_print(out, msg, &ti, false)?;
                        }
                        'l' => write!(out, "{}", msg.payload.len())?,
                        'm' => write!(out, "{}", msg.mid)?,
                        'p' => write_payload(out, &msg.payload, HexMode::Raw)?,
                        'q' => out.write_all(&[msg.qos.value() + b'0'])?,
                        'r' => out.write_all(if msg.retain { b"1" } else { b"0" })?,
                        't' => out.write_all(msg.topic.as_bytes())?,
                        'U' => {
                            let (ti, ns) = now.get();
                            write!(out, "{}.{:09}", ti.timestamp(), ns)?;
                        }
                        'x' => write_payload(out, &msg.payload, HexMode::Lower)?,
                        'X' => write_payload(out, &msg.payload, HexMode::Upper)?,
                        _ => {}
                    }
                }
            }
            '@' => {
                if let Some(n) = chars.next() {
                    if n == '@' {
                        out.write_all(b"@")?;
                    } else if n == 'N' {
                        let (_, ns) = now.get();
                        write!(out, "{:09}", ns)?;
                    } else {
                        let (ti, _) = now.get();
                        let strf = format!("%{}", n);
                        write_strftime(out, &ti, &strf)?;
                    }
                }
            }
            '\\' => {
                if let Some(n) = chars.next() {
                    let b: &[u8] = match n {
                        '\\' => b"\\",
                        '0' => b"\0",
                        'a' => b"\x07",
                        'e' => b"\x1b",
                        'n' => b"\n",
                        'r' => b"\r",
                        't' => b"\t",
                        'v' => b"\x0b",
                        _ => b"",
                    };
                    out.write_all(b)?;
                }
            }
            _ => {
                let mut buf = [0u8; 4];
                out.write_all(c.encode_utf8(&mut buf).as_bytes())?;
            }
        }
    }
    if eol {
        out.write_all(b"\n")?;
    }
    out.flush()
}

/// Render one delivery: the configured format string when set, otherwise
/// the verbose/plain fallback. An empty payload produces no output unless
/// verbose mode is set, which still prints the topic alone.
pub fn print_message(out: &mut dyn Write, cfg: &SessionConfig, msg: &Delivery) -> io::Result<()> {
    if let Some(fmt) = &cfg.format {
        formatted_print(out, fmt, cfg.eol, msg)
    } else if cfg.verbose {
        if !msg.payload.is_empty() {
            out.write_all(msg.topic.as_bytes())?;
            out.write_all(b" ")?;
            write_payload(out, &msg.payload, HexMode::Raw)?;
            if cfg.eol {
                out.write_all(b"\n")?;
            }
        } else if cfg.eol {
            writeln!(out, "{} (null)", msg.topic)?;
        }
        out.flush()
    } else {
        if !msg.payload.is_empty() {
            write_payload(out, &msg.payload, HexMode::Raw)?;
            if cfg.eol {
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::types::QoS;

    fn delivery(topic: &str, payload: &[u8], qos: QoS, retain: bool, mid: u16) -> Delivery {
        Delivery {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos,
            retain,
            mid,
        }
    }

    fn render(fmt: &str, eol: bool, msg: &Delivery) -> Vec<u8> {
        let mut out = Vec::new();
        formatted_print(&mut out, fmt, eol, msg).expect("render");
        out
    }

    #[test]
    fn topic_len_payload() {
        let msg = delivery("x/y", b"hi", QoS::AtMostOnce, false, 0);
        assert_eq!(render("%t:%l:%p\\n", false, &msg), b"x/y:2:hi\n");
    }

    #[test]
    fn literal_escapes_and_verbatim() {
        let msg = delivery("t", b"p", QoS::AtMostOnce, false, 0);
        assert_eq!(render("100%% @@ ok", false, &msg), b"100% @ ok");
        assert_eq!(render("a\\tb\\rc\\\\d", false, &msg), b"a\tb\rc\\d");
    }

    #[test]
    fn trailing_lone_escape_dropped() {
        let msg = delivery("t", b"p", QoS::AtMostOnce, false, 0);
        assert_eq!(render("x%", false, &msg), b"x");
        assert_eq!(render("x@", false, &msg), b"x");
        assert_eq!(render("x\\", false, &msg), b"x");
    }

    #[test]
    fn hex_modes() {
        let msg = delivery("t", &[0xde, 0xad, 0x01], QoS::AtMostOnce, false, 0);
        assert_eq!(render("%x", false, &msg), b"dead01");
        assert_eq!(render("%X", false, &msg), b"DEAD01");
    }

    #[test]
    fn qos_retain_mid() {
        let msg = delivery("t", b"p", QoS::AtLeastOnce, true, 42);
        assert_eq!(render("%q %r %m", false, &msg), b"1 1 42");
        let msg = delivery("t", b"p", QoS::AtMostOnce, false, 0);
        assert_eq!(render("%q %r", false, &msg), b"0 0");
    }

    #[test]
    fn eol_appended() {
        let msg = delivery("t", b"p", QoS::AtMostOnce, false, 0);
        assert_eq!(render("%p", true, &msg), b"p\n");
    }

    #[test]
    fn round_trip_fields() {
        let msg = delivery("x/y", b"hi", QoS::ExactlyOnce, true, 7);
        let text = String::from_utf8(render("%t|%l|%p|%q|%r", false, &msg)).expect("utf8");
        let parts: Vec<&str> = text.split('|').collect();
        assert_eq!(parts[0], msg.topic);
        assert_eq!(parts[1].parse::<usize>().expect("len"), msg.payload.len());
        assert_eq!(parts[2].as_bytes(), &msg.payload[..]);
        assert_eq!(parts[3].parse::<u8>().expect("qos"), msg.qos.value());
        assert_eq!(parts[4], "1");
    }

    #[test]
    fn json_escaped_payload() {
        let msg = delivery("a/b", b"say \"hi\"\n", QoS::AtLeastOnce, false, 3);
        let text = String::from_utf8(render("%j", false, &msg)).expect("utf8");
        let v: serde_json::Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(v["topic"], "a/b");
        assert_eq!(v["qos"], 1);
        assert_eq!(v["retain"], 0);
        assert_eq!(v["payloadlen"], 9);
        assert_eq!(v["mid"], 3);
        assert_eq!(v["payload"], "say \"hi\"\n");
        // field order is fixed
        assert!(text.starts_with("{\"tst\":"));
        let topic_at = text.find("\"topic\"").expect("topic");
        let qos_at = text.find("\"qos\"").expect("qos");
        let payload_at = text.find("\"payload\"").expect("payload");
        assert!(topic_at < qos_at && qos_at < payload_at);
    }

    #[test]
    fn json_mid_omitted_at_qos_zero() {
        let msg = delivery("a", b"x", QoS::AtMostOnce, false, 0);
        let text = String::from_utf8(render("%j", false, &msg)).expect("utf8");
        assert!(!text.contains("\"mid\""));
    }

    #[test]
    fn unix_timestamp_has_nanos() {
        let msg = delivery("t", b"p", QoS::AtMostOnce, false, 0);
        let text = String::from_utf8(render("%U", false, &msg)).expect("utf8");
        let (secs, nanos) = text.split_once('.').expect("dot");
        assert!(secs.parse::<i64>().expect("secs") > 0);
        assert_eq!(nanos.len(), 9);
    }

    #[test]
    fn strftime_directive() {
        let msg = delivery("t", b"p", QoS::AtMostOnce, false, 0);
        let year = String::from_utf8(render("@Y", false, &msg)).expect("utf8");
        assert_eq!(year.len(), 4);
        assert!(year.parse::<u32>().expect("year") >= 2024);
        let nanos = render("@N", false, &msg);
        assert_eq!(nanos.len(), 9);
    }

    fn fallback(cfg: &SessionConfig, msg: &Delivery) -> Vec<u8> {
        let mut out = Vec::new();
        print_message(&mut out, cfg, msg).expect("render");
        out
    }

    #[test]
    fn fallback_plain_and_verbose() {
        let mut cfg = SessionConfig::default();
        let msg = delivery("x/y", b"hi", QoS::AtMostOnce, false, 0);
        assert_eq!(fallback(&cfg, &msg), b"hi\n");

        cfg.verbose = true;
        assert_eq!(fallback(&cfg, &msg), b"x/y hi\n");

        let empty = delivery("x/y", b"", QoS::AtMostOnce, false, 0);
        assert_eq!(fallback(&cfg, &empty), b"x/y (null)\n");

        cfg.verbose = false;
        assert_eq!(fallback(&cfg, &empty), b"");
    }
}
