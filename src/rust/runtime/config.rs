// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    network::types::MacAddress,
};
use ::std::{
    collections::HashMap,
    fs::File,
    io::Read,
    net::Ipv4Addr,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    yaml::Hash,
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Stack identity. Environment variables named after the bare key override these.
mod stack_config {
    pub const SECTION_NAME: &str = "tapstack";
    pub const LOCAL_IPV4_ADDR: &str = "local_ipv4_addr";
    pub const LOCAL_LINK_ADDR: &str = "local_link_addr";
    pub const INTERFACE_NAME: &str = "interface_name";
    pub const DEFAULT_INTERFACE_NAME: &str = "tap0";
    pub const MTU: &str = "mtu";
    pub const DEFAULT_MTU: u16 = 1500;
    pub const ARP_TABLE: &str = "arp_table";
}

mod scheduler_config {
    pub const SECTION_NAME: &str = "scheduler";
    pub const WORKER_THREADS: &str = "worker_threads";
    pub const DEFAULT_WORKER_THREADS: usize = 4;
    pub const TIMER_THREADS: &str = "timer_threads";
    pub const DEFAULT_TIMER_THREADS: usize = 2;
}

mod memory_config {
    pub const SECTION_NAME: &str = "memory";
    pub const POOL_BUFFERS: &str = "pool_buffers";
    pub const DEFAULT_POOL_BUFFERS: usize = 1024;
    pub const BUFFER_SIZE: &str = "buffer_size";
    pub const DEFAULT_BUFFER_SIZE: usize = 2048;
    pub const HEADER_RESERVE: &str = "header_reserve";
    pub const DEFAULT_HEADER_RESERVE: usize = 128;
}

mod reassembly_config {
    pub const SECTION_NAME: &str = "reassembly";
    pub const PARTITIONS: &str = "partitions";
    pub const DEFAULT_PARTITIONS: usize = 4;
    pub const MAILBOX_CAPACITY: &str = "mailbox_capacity";
    pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;
    pub const BASE_TTL_MICROS: &str = "base_ttl_micros";
    pub const DEFAULT_BASE_TTL_MICROS: u64 = 500_000;
    pub const BACKOFF_FACTOR: &str = "backoff_factor";
    pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
    pub const GIVEUP_TTL_MICROS: &str = "giveup_ttl_micros";
    pub const DEFAULT_GIVEUP_TTL_MICROS: u64 = 8_000_000;
}

mod tcp_config {
    pub const SECTION_NAME: &str = "tcp";
    pub const WORKERS_PER_PORT: &str = "workers_per_port";
    pub const DEFAULT_WORKERS_PER_PORT: usize = 1;
    pub const MAILBOX_CAPACITY: &str = "mailbox_capacity";
    pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;
    pub const MAX_CONNECTIONS: &str = "max_connections";
    pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
}

/// Smallest MTU every IPv4 link must carry.
const MIN_MTU: u16 = 68;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Stack configuration.
///
/// Every option is looked up in the environment first, then in the YAML document. Options of the `tapstack` section
/// are overridden by the upper-cased key (`MTU`), options of other sections by the upper-cased `<section>_<key>`
/// (`REASSEMBLY_PARTITIONS`). Missing options fall back to built-in defaults, except for the local addresses.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_str(&config_s)
    }

    /// Parses a YAML document holding exactly one configuration object.
    pub fn from_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration: {}", e);
                error!("from_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            &[ref c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };
        Ok(Self(config_obj.clone()))
    }

    /// Stack config: local IPv4 address. Required.
    pub fn local_ipv4_addr(&self) -> Result<Ipv4Addr, Fail> {
        let local_ipv4_addr: Ipv4Addr = match Self::get_typed_env_option(stack_config::LOCAL_IPV4_ADDR)? {
            Some(addr) => addr,
            None => Self::get_typed_str_option(
                self.get_section(stack_config::SECTION_NAME)?,
                stack_config::LOCAL_IPV4_ADDR,
                |val: &str| val.parse().ok(),
            )?,
        };
        if local_ipv4_addr.is_unspecified() || local_ipv4_addr.is_broadcast() {
            let cause: String = format!("Invalid IPv4 address");
            error!("local_ipv4_addr(): {:?}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(local_ipv4_addr)
    }

    /// Stack config: local link address. Required.
    pub fn local_link_addr(&self) -> Result<MacAddress, Fail> {
        let local_link_addr: MacAddress = match Self::get_typed_env_option(stack_config::LOCAL_LINK_ADDR)? {
            Some(addr) => addr,
            None => Self::get_typed_str_option(
                self.get_section(stack_config::SECTION_NAME)?,
                stack_config::LOCAL_LINK_ADDR,
                |val: &str| MacAddress::parse_str(val).ok(),
            )?,
        };
        if !local_link_addr.is_unicast() {
            let cause: String = format!("local link address must be unicast ({})", local_link_addr);
            error!("local_link_addr(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(local_link_addr)
    }

    /// Stack config: name of the TAP interface.
    pub fn interface_name(&self) -> Result<String, Fail> {
        if let Some(name) = Self::get_typed_env_option(stack_config::INTERFACE_NAME)? {
            return Ok(name);
        }
        match self.find_option(stack_config::SECTION_NAME, stack_config::INTERFACE_NAME) {
            Some(yaml) => match yaml.as_str() {
                Some(name) => Ok(name.to_string()),
                None => Err(Self::unexpected_type(stack_config::INTERFACE_NAME)),
            },
            None => Ok(stack_config::DEFAULT_INTERFACE_NAME.to_string()),
        }
    }

    /// Stack config: link MTU.
    pub fn mtu(&self) -> Result<u16, Fail> {
        let mtu: u16 = match Self::get_typed_env_option(stack_config::MTU)? {
            Some(mtu) => mtu,
            None => self.get_int_or(stack_config::SECTION_NAME, stack_config::MTU, stack_config::DEFAULT_MTU)?,
        };
        if mtu < MIN_MTU {
            let cause: String = format!("mtu must be at least {} (mtu={})", MIN_MTU, mtu);
            error!("mtu(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        Ok(mtu)
    }

    /// Stack config: static ARP entries, keyed by IPv4 address. Cannot be passed in as an environment variable.
    pub fn arp_table(&self) -> Result<HashMap<Ipv4Addr, MacAddress>, Fail> {
        let table: &Hash = match self.find_option(stack_config::SECTION_NAME, stack_config::ARP_TABLE) {
            Some(Yaml::Hash(table)) => table,
            Some(_) => return Err(Self::unexpected_type(stack_config::ARP_TABLE)),
            None => return Ok(HashMap::new()),
        };
        let mut result: HashMap<Ipv4Addr, MacAddress> = HashMap::with_capacity(table.len());
        for (k, v) in table {
            let ipv4_addr: Ipv4Addr = match k.as_str().map(str::parse) {
                Some(Ok(ip)) => ip,
                _ => {
                    let cause: String = format!("Couldn't parse ARP table ip_addr in config: {:?}", k);
                    error!("arp_table(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                },
            };
            let link_addr: MacAddress = match v.as_str() {
                Some(link_string) => MacAddress::parse_str(link_string)?,
                None => {
                    let cause: String = format!("Couldn't parse ARP table link_addr in config: {:?}", v);
                    error!("arp_table(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                },
            };
            result.insert(ipv4_addr, link_addr);
        }
        Ok(result)
    }

    pub fn worker_threads(&self) -> Result<usize, Fail> {
        self.get_positive(
            scheduler_config::SECTION_NAME,
            scheduler_config::WORKER_THREADS,
            scheduler_config::DEFAULT_WORKER_THREADS,
        )
    }

    pub fn timer_threads(&self) -> Result<usize, Fail> {
        self.get_positive(
            scheduler_config::SECTION_NAME,
            scheduler_config::TIMER_THREADS,
            scheduler_config::DEFAULT_TIMER_THREADS,
        )
    }

    /// Memory config: number of buffers in the pool.
    pub fn pool_buffers(&self) -> Result<usize, Fail> {
        self.get_positive(
            memory_config::SECTION_NAME,
            memory_config::POOL_BUFFERS,
            memory_config::DEFAULT_POOL_BUFFERS,
        )
    }

    /// Memory config: size of every pool slot, header reserve included.
    pub fn buffer_size(&self) -> Result<usize, Fail> {
        let size: usize = self.get_positive(
            memory_config::SECTION_NAME,
            memory_config::BUFFER_SIZE,
            memory_config::DEFAULT_BUFFER_SIZE,
        )?;
        let reserve: usize = self.header_reserve()?;
        if size <= reserve {
            let cause: String = format!("buffer_size must exceed header_reserve ({} <= {})", size, reserve);
            error!("buffer_size(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        Ok(size)
    }

    /// Memory config: bytes kept in front of every buffer for headers.
    pub fn header_reserve(&self) -> Result<usize, Fail> {
        self.get_setting(
            memory_config::SECTION_NAME,
            memory_config::HEADER_RESERVE,
            memory_config::DEFAULT_HEADER_RESERVE,
        )
    }

    pub fn reassembly_partitions(&self) -> Result<usize, Fail> {
        self.get_positive(
            reassembly_config::SECTION_NAME,
            reassembly_config::PARTITIONS,
            reassembly_config::DEFAULT_PARTITIONS,
        )
    }

    pub fn reassembly_mailbox_capacity(&self) -> Result<usize, Fail> {
        self.get_capacity(
            reassembly_config::SECTION_NAME,
            reassembly_config::MAILBOX_CAPACITY,
            reassembly_config::DEFAULT_MAILBOX_CAPACITY,
        )
    }

    /// Reassembly config: time-to-live a message starts with, and returns to on every new fragment.
    pub fn reassembly_base_ttl(&self) -> Result<Duration, Fail> {
        let micros: u64 = self.get_setting(
            reassembly_config::SECTION_NAME,
            reassembly_config::BASE_TTL_MICROS,
            reassembly_config::DEFAULT_BASE_TTL_MICROS,
        )?;
        Ok(Duration::from_micros(micros))
    }

    /// Reassembly config: factor applied to the time-to-live after every unsuccessful check.
    pub fn reassembly_backoff_factor(&self) -> Result<f64, Fail> {
        let section: &str = reassembly_config::SECTION_NAME;
        let key: &str = reassembly_config::BACKOFF_FACTOR;
        let factor: f64 = match Self::get_typed_env_option(&Self::env_name(section, key))? {
            Some(factor) => factor,
            None => match self.find_option(section, key) {
                Some(yaml) => match yaml {
                    Yaml::Real(_) => yaml.as_f64().ok_or_else(|| Self::unexpected_type(key))?,
                    Yaml::Integer(i) => *i as f64,
                    _ => return Err(Self::unexpected_type(key)),
                },
                None => reassembly_config::DEFAULT_BACKOFF_FACTOR,
            },
        };
        if !(factor > 1.0) {
            let cause: String = format!("backoff_factor must be greater than 1 (factor={})", factor);
            error!("reassembly_backoff_factor(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        Ok(factor)
    }

    /// Reassembly config: a message whose time-to-live grows past this is dropped.
    pub fn reassembly_giveup_ttl(&self) -> Result<Duration, Fail> {
        let micros: u64 = self.get_setting(
            reassembly_config::SECTION_NAME,
            reassembly_config::GIVEUP_TTL_MICROS,
            reassembly_config::DEFAULT_GIVEUP_TTL_MICROS,
        )?;
        Ok(Duration::from_micros(micros))
    }

    pub fn tcp_workers_per_port(&self) -> Result<usize, Fail> {
        self.get_positive(
            tcp_config::SECTION_NAME,
            tcp_config::WORKERS_PER_PORT,
            tcp_config::DEFAULT_WORKERS_PER_PORT,
        )
    }

    pub fn tcp_mailbox_capacity(&self) -> Result<usize, Fail> {
        self.get_capacity(
            tcp_config::SECTION_NAME,
            tcp_config::MAILBOX_CAPACITY,
            tcp_config::DEFAULT_MAILBOX_CAPACITY,
        )
    }

    pub fn tcp_max_connections(&self) -> Result<usize, Fail> {
        self.get_positive(
            tcp_config::SECTION_NAME,
            tcp_config::MAX_CONNECTIONS,
            tcp_config::DEFAULT_MAX_CONNECTIONS,
        )
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    fn get_section(&self, section: &str) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, section)
    }

    /// Looks up `section.key`, treating a missing section or key as absent.
    fn find_option(&self, section: &str, key: &str) -> Option<&Yaml> {
        match self.0.index(section) {
            Yaml::Hash(_) => match self.0.index(section).index(key) {
                Yaml::BadValue | Yaml::Null => None,
                value => Some(value),
            },
            _ => None,
        }
    }

    fn env_name(section: &str, key: &str) -> String {
        if section == stack_config::SECTION_NAME {
            key.to_string()
        } else {
            format!("{}_{}", section, key)
        }
    }

    /// Integer option with environment override and default.
    fn get_setting<T: FromStr + TryFrom<i64>>(&self, section: &str, key: &str, default: T) -> Result<T, Fail> {
        if let Some(value) = Self::get_typed_env_option(&Self::env_name(section, key))? {
            return Ok(value);
        }
        self.get_int_or(section, key, default)
    }

    fn get_int_or<T: TryFrom<i64>>(&self, section: &str, key: &str, default: T) -> Result<T, Fail> {
        match self.find_option(section, key) {
            Some(_) => Self::get_int_option(self.get_section(section)?, key),
            None => Ok(default),
        }
    }

    /// Integer option that must be non-zero.
    fn get_positive(&self, section: &str, key: &str, default: usize) -> Result<usize, Fail> {
        let value: usize = self.get_setting(section, key, default)?;
        if value == 0 {
            let cause: String = format!("parameter \"{}.{}\" must be positive", section, key);
            error!("get_positive(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        Ok(value)
    }

    /// Queue capacity option, which must be a power of two.
    fn get_capacity(&self, section: &str, key: &str, default: usize) -> Result<usize, Fail> {
        let value: usize = self.get_setting(section, key, default)?;
        if !value.is_power_of_two() {
            let cause: String = format!("parameter \"{}.{}\" must be a power of two ({})", section, key, value);
            error!("get_capacity(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(value)
    }

    fn unexpected_type(index: &str) -> Fail {
        let message: String = format!("parameter {} has unexpected type", index);
        Fail::new(libc::EINVAL, message.as_str())
    }

    /// Similar to `get_typed_option` using `Yaml::as_hash` receiver. This method returns a `&Yaml` instead of
    /// yaml::Hash, and Yaml is more natural for indexing.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it exists and that the receiver returns Some(_).
    fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let option: &'a Yaml = Self::get_option(yaml, index)?;
        receiver(option).ok_or_else(|| Self::unexpected_type(index))
    }

    /// Index `yaml` to find value at `index`, validating it as a string.
    fn get_typed_str_option<T, Fn>(yaml: &Yaml, index: &str, parser: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&str) -> Option<T>,
    {
        let option: &Yaml = Self::get_option(yaml, index)?;
        option
            .as_str()
            .and_then(parser)
            .ok_or_else(|| Self::unexpected_type(index))
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            return match var.as_str().parse() {
                Ok(value) => Ok(Some(value)),
                Err(_) => Err(Self::unexpected_type(index)),
            };
        }
        Ok(None)
    }

    /// Similar to `get_typed_option` using `Yaml::as_i64` as the receiver, but additionally verifies that the
    /// destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = Self::get_typed_option(yaml, index, &Yaml::as_i64)?;
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Built-in defaults for everything but the local addresses.
impl Default for Config {
    fn default() -> Self {
        Self(Yaml::Hash(Hash::new()))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
