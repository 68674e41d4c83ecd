//! Parsers for the compose-style shorthands accepted in target records.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::engine::PortBinding;

/// A value given either as a single string or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    String(String),
    List(Vec<String>),
}

impl StringOrList {
    /// Splits a string form on whitespace, as a shell-less command line.
    pub fn into_args(self) -> Vec<String> {
        match self {
            StringOrList::String(s) => s.split_whitespace().map(String::from).collect(),
            StringOrList::List(list) => list,
        }
    }

    pub fn into_list(self) -> Vec<String> {
        match self {
            StringOrList::String(s) => vec![s],
            StringOrList::List(list) => list,
        }
    }
}

/// A value given either as a string or as a number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum StringOrNumber {
    Number(f64),
    String(String),
}

impl StringOrNumber {
    pub fn as_string(&self) -> String {
        match self {
            StringOrNumber::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            StringOrNumber::Number(n) => n.to_string(),
            StringOrNumber::String(s) => s.clone(),
        }
    }
}

/// Parses `512m`, `1.5g`, `1024k` or plain bytes.
pub fn parse_memory(value: &StringOrNumber) -> Option<i64> {
    let text = value.as_string().trim().to_ascii_lowercase();
    let text = text.strip_suffix('b').unwrap_or(&text);
    let (number, multiplier) = match text.chars().last()? {
        'k' => (&text[..text.len() - 1], 1024_f64),
        'm' => (&text[..text.len() - 1], 1024_f64 * 1024.0),
        'g' => (&text[..text.len() - 1], 1024_f64 * 1024.0 * 1024.0),
        _ => (text, 1.0),
    };
    let parsed: f64 = number.trim().parse().ok()?;
    if parsed < 0.0 {
        return None;
    }
    Some((parsed * multiplier) as i64)
}

/// Parses compose durations such as `1m30s`, `10s`, `500ms` or `2h` into
/// nanoseconds. Plain numbers are seconds.
pub fn parse_duration_nanos(value: &StringOrNumber) -> Option<u64> {
    const UNITS: &[(&str, f64)] = &[
        ("ms", 1e6),
        ("us", 1e3),
        ("ns", 1.0),
        ("h", 3600e9),
        ("m", 60e9),
        ("s", 1e9),
    ];
    let text = value.as_string();
    let text = text.trim();
    if let Ok(seconds) = text.parse::<f64>() {
        return (seconds >= 0.0).then(|| (seconds * 1e9) as u64);
    }
    let mut total = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let number: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let (unit, factor) = UNITS.iter().find(|(unit, _)| rest.starts_with(unit))?;
        total += number * factor;
        rest = &rest[unit.len()..];
    }
    Some(total as u64)
}

/// One container port published on the host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct PortMap {
    pub host_ip: String,
    pub host_port: String,
    pub container_port: u16,
    pub protocol: String,
}

impl PortMap {
    /// Parses `[ip:][host:]container[/proto]`, where the port parts may be
    /// equal-length ranges such as `8000-8002`.
    pub fn parse(spec: &str) -> Option<Vec<PortMap>> {
        let (ports, protocol) = match spec.split_once('/') {
            Some((ports, proto)) => (ports, proto.to_ascii_lowercase()),
            None => (spec, "tcp".to_string()),
        };
        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host, container) = match parts.as_slice() {
            [container] => ("", None, *container),
            [host, container] => ("", Some(*host), *container),
            [ip, host, container] => (*ip, Some(*host), *container),
            _ => return None,
        };
        let container_range = parse_range(container)?;
        let host_range = match host {
            Some(h) if !h.is_empty() => Some(parse_range(h)?),
            _ => None,
        };
        if let Some((start, end)) = host_range {
            if end - start != container_range.1 - container_range.0 {
                return None;
            }
        }
        Some(
            (container_range.0..=container_range.1)
                .enumerate()
                .map(|(offset, container_port)| PortMap {
                    host_ip: host_ip.to_string(),
                    host_port: host_range
                        .map(|(start, _)| (start + offset as u16).to_string())
                        .unwrap_or_default(),
                    container_port,
                    protocol: protocol.clone(),
                })
                .collect(),
        )
    }

    /// Engine key for the container side, e.g. `80/tcp`.
    pub fn exposed_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }

    pub fn binding(&self) -> PortBinding {
        PortBinding {
            host_ip: self.host_ip.clone(),
            host_port: self.host_port.clone(),
        }
    }

    /// Rebuilds port maps from engine port bindings.
    pub fn from_bindings(bindings: &BTreeMap<String, Vec<PortBinding>>) -> Vec<PortMap> {
        let mut maps = Vec::new();
        for (key, binds) in bindings {
            let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            let Ok(container_port) = port.parse::<u16>() else {
                continue;
            };
            for bind in binds {
                maps.push(PortMap {
                    host_ip: bind.host_ip.clone(),
                    host_port: bind.host_port.clone(),
                    container_port,
                    protocol: protocol.to_string(),
                });
            }
        }
        maps
    }
}

fn parse_range(text: &str) -> Option<(u16, u16)> {
    match text.split_once('-') {
        Some((a, b)) => {
            let (a, b) = (a.parse().ok()?, b.parse().ok()?);
            (a <= b).then_some((a, b))
        }
        None => {
            let p = text.parse().ok()?;
            Some((p, p))
        }
    }
}

/// Normalizes `80` or `80/udp` into an exposed-port key.
pub fn expose_key(value: &StringOrNumber) -> String {
    let text = value.as_string();
    if text.contains('/') {
        text
    } else {
        format!("{text}/tcp")
    }
}

/// `KEY=value` list into a map. Entries without `=` get an empty value.
pub fn env_list_to_map(env: &[String]) -> BTreeMap<String, String> {
    env.iter()
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect()
}

pub fn env_map_to_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> StringOrNumber {
        StringOrNumber::String(v.to_string())
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory(&s("512m")), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory(&s("1g")), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory(&s("64kb")), Some(64 * 1024));
        assert_eq!(parse_memory(&StringOrNumber::Number(2048.0)), Some(2048));
        assert_eq!(parse_memory(&s("lots")), None);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_nanos(&s("1m30s")), Some(90_000_000_000));
        assert_eq!(parse_duration_nanos(&s("500ms")), Some(500_000_000));
        assert_eq!(parse_duration_nanos(&StringOrNumber::Number(10.0)), Some(10_000_000_000));
        assert_eq!(parse_duration_nanos(&s("10 parsecs")), None);
    }

    #[test]
    fn test_parse_ports() {
        let maps = PortMap::parse("8080:80").unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].host_port, "8080");
        assert_eq!(maps[0].exposed_key(), "80/tcp");

        let maps = PortMap::parse("127.0.0.1:5353:53/udp").unwrap();
        assert_eq!(maps[0].host_ip, "127.0.0.1");
        assert_eq!(maps[0].protocol, "udp");

        let maps = PortMap::parse("8000-8002:9000-9002").unwrap();
        let pairs: Vec<(String, u16)> =
            maps.into_iter().map(|m| (m.host_port, m.container_port)).collect();
        assert_eq!(
            pairs,
            vec![
                ("8000".to_string(), 9000),
                ("8001".to_string(), 9001),
                ("8002".to_string(), 9002)
            ]
        );

        assert!(PortMap::parse("8000-8001:9000").is_none());
        assert!(PortMap::parse("http").is_none());
    }

    #[test]
    fn test_port_bindings_roundtrip() {
        let maps = PortMap::parse("8080:80").unwrap();
        let mut bindings = BTreeMap::new();
        bindings.insert(maps[0].exposed_key(), vec![maps[0].binding()]);
        assert_eq!(PortMap::from_bindings(&bindings), maps);
    }

    #[test]
    fn test_env_conversion() {
        let list = vec!["A=1".to_string(), "B=x=y".to_string(), "C".to_string()];
        let map = env_list_to_map(&list);
        assert_eq!(map["B"], "x=y");
        assert_eq!(map["C"], "");
        assert_eq!(env_map_to_list(&map), vec!["A=1", "B=x=y", "C="]);
    }
}
