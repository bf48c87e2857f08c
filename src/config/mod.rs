
use std::fmt::Write as _;
use std::time::Duration;

use log::warn;

use crate::error::{Error, Result};

/// A single `key = value` item inside a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigItem {
    pub name: String,
    pub value: String,
}

/// A `[name]` category with its items, kept in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigCategory {
    pub name: String,
    pub items: Vec<ConfigItem>,
}

impl ConfigCategory {
    pub fn item(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.value.as_str())
    }

    pub fn set_item(&mut self, name: &str, value: &str) {
        if let Some(item) = self.items.iter_mut().find(|i| i.name == name) {
            item.value = value.to_owned();
        } else {
            self.items.push(ConfigItem {
                name: name.to_owned(),
                value: value.to_owned(),
            });
        }
    }
}

/// INI-style configuration document: ordered categories of `key = value`
/// items. Whole-line comments begin with `#` or `;`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigFile {
    pub categories: Vec<ConfigCategory>,
}

impl ConfigFile {
    pub fn parse(input: &str) -> Result<Self> {
        let mut cfg = ConfigFile::default();
        for (lineno, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or(Error::ErrConfigParse(lineno + 1))?;
                cfg.add_category(name.trim());
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(Error::ErrConfigParse(lineno + 1))?;
            let category = match cfg.categories.last_mut() {
                Some(c) => c,
                None => return Err(Error::ErrConfigParse(lineno + 1)),
            };
            category.items.push(ConfigItem {
                name: key.trim().to_owned(),
                value: value.trim().to_owned(),
            });
        }
        Ok(cfg)
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for category in &self.categories {
            let _ = writeln!(out, "[{}]", category.name);
            for item in &category.items {
                let _ = writeln!(out, "{} = {}", item.name, item.value);
            }
        }
        out
    }

    pub fn category(&self, name: &str) -> Option<&ConfigCategory> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn add_category(&mut self, name: &str) -> &mut ConfigCategory {
        if let Some(pos) = self.categories.iter().position(|c| c.name == name) {
            return &mut self.categories[pos];
        }
        self.categories.push(ConfigCategory {
            name: name.to_owned(),
            items: vec![],
        });
        self.categories.last_mut().unwrap()
    }

    pub fn set_item(&mut self, category: &str, name: &str, value: &str) {
        self.add_category(category).set_item(name, value);
    }

    fn bool_item(&self, category: &str, name: &str) -> Result<Option<bool>> {
        match self.category(category).and_then(|c| c.item(name)) {
            None => Ok(None),
            Some(v) => match v {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                _ => Err(Error::ErrConfigInvalid(format!("{category}.{name}={v}"))),
            },
        }
    }

    fn num_item<T: std::str::FromStr>(&self, category: &str, name: &str) -> Result<Option<T>> {
        match self.category(category).and_then(|c| c.item(name)) {
            None => Ok(None),
            Some(v) => v
                .parse::<T>()
                .map(Some)
                .map_err(|_| Error::ErrConfigInvalid(format!("{category}.{name}={v}"))),
        }
    }
}

/// TURN relaying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnTransport {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl std::str::FromStr for TurnTransport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "udp" => Ok(TurnTransport::Udp),
            "tcp" => Ok(TurnTransport::Tcp),
            "tls" => Ok(TurnTransport::Tls),
            _ => Err(Error::ErrConfigInvalid(format!("turn_type={s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunServer {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub host: String,
    pub port: u16,
    pub transport: TurnTransport,
    pub user: String,
    pub pwd: String,
}

/// TURN REST API backend (draft-uberti-behave-turn-rest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRestApi {
    pub url: String,
    pub key: String,
    /// HTTP method, POST unless configured otherwise.
    pub method: String,
}

/// Heuristic knobs for the skew compensator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewTunables {
    pub audio_threshold_ms: i64,
    pub video_threshold_ms: i64,
    pub warmup: Duration,
}

impl Default for SkewTunables {
    fn default() -> Self {
        SkewTunables {
            audio_threshold_ms: 40,
            video_threshold_ms: 40,
            warmup: Duration::from_secs(15),
        }
    }
}

/// Knobs for slow-link detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowLinkTunables {
    /// NACKs inside the rolling window before a notification fires.
    pub nack_threshold: u32,
    /// Width of the rolling window.
    pub window: Duration,
    /// Minimum spacing of notifications, per direction.
    pub min_interval: Duration,
}

impl Default for SlowLinkTunables {
    fn default() -> Self {
        SlowLinkTunables {
            nack_threshold: 20,
            window: Duration::from_secs(2),
            min_interval: Duration::from_secs(60),
        }
    }
}

/// Typed view over the `[general]`, `[nat]`, `[media]` and
/// `[certificates]` categories the gateway consumes at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub ice_lite: bool,
    pub ice_tcp: bool,
    pub full_trickle: bool,
    pub ipv6: bool,
    pub rtp_port_range: Option<(u16, u16)>,
    pub stun_server: Option<StunServer>,
    pub turn_server: Option<TurnServer>,
    pub turn_rest_api: Option<TurnRestApi>,
    /// Only gather candidates on interfaces/prefixes in this list.
    pub interfaces_enforce: Vec<String>,
    /// Never gather candidates on interfaces/prefixes in this list;
    /// enforce wins when both match.
    pub interfaces_ignore: Vec<String>,
    pub max_nack_queue: usize,
    pub no_media_timer: Duration,
    pub rfc4588_enabled: bool,
    pub skew: SkewTunables,
    pub slow_link: SlowLinkTunables,
    pub session_timeout: Duration,
    pub api_secret: Option<String>,
    pub token_auth_secret: Option<String>,
    pub dtls_cert_names: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            ice_lite: false,
            ice_tcp: false,
            full_trickle: false,
            ipv6: false,
            rtp_port_range: None,
            stun_server: None,
            turn_server: None,
            turn_rest_api: None,
            interfaces_enforce: vec![],
            interfaces_ignore: vec![],
            max_nack_queue: 512,
            no_media_timer: Duration::from_secs(1),
            rfc4588_enabled: false,
            skew: SkewTunables::default(),
            slow_link: SlowLinkTunables::default(),
            session_timeout: Duration::from_secs(60),
            api_secret: None,
            token_auth_secret: None,
            dtls_cert_names: vec!["rtc-gateway".to_owned()],
        }
    }
}

const KNOWN_GENERAL: &[&str] = &[
    "session_timeout",
    "api_secret",
    "token_auth_secret",
    "no_media_timer",
];
const KNOWN_NAT: &[&str] = &[
    "ice_lite",
    "ice_tcp",
    "full_trickle",
    "ipv6",
    "stun_server",
    "stun_port",
    "turn_server",
    "turn_port",
    "turn_type",
    "turn_user",
    "turn_pwd",
    "turn_rest_api",
    "turn_rest_api_key",
    "turn_rest_api_method",
    "ice_enforce_list",
    "ice_ignore_list",
];
const KNOWN_MEDIA: &[&str] = &[
    "rtp_port_range",
    "max_nack_queue",
    "rfc4588",
    "audio_skew_threshold",
    "video_skew_threshold",
    "skew_warmup",
    "slowlink_nack_threshold",
    "slowlink_window",
    "slowlink_min_interval",
];

impl GatewayConfig {
    /// Builds the startup configuration from a parsed INI document.
    /// Unknown keys are warned about and skipped; malformed values are
    /// fatal.
    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        let mut gc = GatewayConfig::default();

        for (category, known) in [
            ("general", KNOWN_GENERAL),
            ("nat", KNOWN_NAT),
            ("media", KNOWN_MEDIA),
        ] {
            if let Some(c) = cfg.category(category) {
                for item in &c.items {
                    if !known.contains(&item.name.as_str()) {
                        warn!("unknown configuration item {}.{}", category, item.name);
                    }
                }
            }
        }

        if let Some(secs) = cfg.num_item::<u64>("general", "session_timeout")? {
            gc.session_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cfg.num_item::<u64>("general", "no_media_timer")? {
            gc.no_media_timer = Duration::from_secs(secs);
        }
        gc.api_secret = cfg
            .category("general")
            .and_then(|c| c.item("api_secret"))
            .map(str::to_owned);
        gc.token_auth_secret = cfg
            .category("general")
            .and_then(|c| c.item("token_auth_secret"))
            .map(str::to_owned);

        gc.ice_lite = cfg.bool_item("nat", "ice_lite")?.unwrap_or(gc.ice_lite);
        gc.ice_tcp = cfg.bool_item("nat", "ice_tcp")?.unwrap_or(gc.ice_tcp);
        gc.full_trickle = cfg
            .bool_item("nat", "full_trickle")?
            .unwrap_or(gc.full_trickle);
        gc.ipv6 = cfg.bool_item("nat", "ipv6")?.unwrap_or(gc.ipv6);

        let nat = cfg.category("nat");
        if let Some(host) = nat.and_then(|c| c.item("stun_server")) {
            gc.stun_server = Some(StunServer {
                host: host.to_owned(),
                port: cfg.num_item::<u16>("nat", "stun_port")?.unwrap_or(3478),
            });
        }
        if let Some(host) = nat.and_then(|c| c.item("turn_server")) {
            gc.turn_server = Some(TurnServer {
                host: host.to_owned(),
                port: cfg.num_item::<u16>("nat", "turn_port")?.unwrap_or(3478),
                transport: nat
                    .and_then(|c| c.item("turn_type"))
                    .map(str::parse)
                    .transpose()?
                    .unwrap_or_default(),
                user: nat
                    .and_then(|c| c.item("turn_user"))
                    .unwrap_or_default()
                    .to_owned(),
                pwd: nat
                    .and_then(|c| c.item("turn_pwd"))
                    .unwrap_or_default()
                    .to_owned(),
            });
        }
        if let Some(api) = nat.and_then(|c| c.item("turn_rest_api")) {
            gc.turn_rest_api = Some(TurnRestApi {
                url: api.to_owned(),
                key: nat
                    .and_then(|c| c.item("turn_rest_api_key"))
                    .unwrap_or_default()
                    .to_owned(),
                method: nat
                    .and_then(|c| c.item("turn_rest_api_method"))
                    .unwrap_or("POST")
                    .to_owned(),
            });
        }
        gc.interfaces_enforce = list_item(nat, "ice_enforce_list");
        gc.interfaces_ignore = list_item(nat, "ice_ignore_list");

        if let Some(range) = cfg.category("media").and_then(|c| c.item("rtp_port_range")) {
            let (min, max) = range
                .split_once('-')
                .ok_or_else(|| Error::ErrConfigInvalid(format!("rtp_port_range={range}")))?;
            let min = min.trim().parse::<u16>()?;
            let max = max.trim().parse::<u16>()?;
            if max < min {
                return Err(Error::ErrConfigInvalid(format!("rtp_port_range={range}")));
            }
            gc.rtp_port_range = Some((min, max));
        }
        if let Some(mnq) = cfg.num_item::<usize>("media", "max_nack_queue")? {
            gc.max_nack_queue = mnq;
        }
        gc.rfc4588_enabled = cfg
            .bool_item("media", "rfc4588")?
            .unwrap_or(gc.rfc4588_enabled);
        if let Some(ms) = cfg.num_item::<i64>("media", "audio_skew_threshold")? {
            gc.skew.audio_threshold_ms = ms;
        }
        if let Some(ms) = cfg.num_item::<i64>("media", "video_skew_threshold")? {
            gc.skew.video_threshold_ms = ms;
        }
        if let Some(secs) = cfg.num_item::<u64>("media", "skew_warmup")? {
            gc.skew.warmup = Duration::from_secs(secs);
        }
        if let Some(n) = cfg.num_item::<u32>("media", "slowlink_nack_threshold")? {
            gc.slow_link.nack_threshold = n;
        }
        if let Some(secs) = cfg.num_item::<u64>("media", "slowlink_window")? {
            gc.slow_link.window = Duration::from_secs(secs);
        }
        if let Some(secs) = cfg.num_item::<u64>("media", "slowlink_min_interval")? {
            gc.slow_link.min_interval = Duration::from_secs(secs);
        }

        Ok(gc)
    }
}

fn list_item(category: Option<&ConfigCategory>, name: &str) -> Vec<String> {
    category
        .and_then(|c| c.item(name))
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
