use std::{
    collections::{BTreeMap, HashMap},
    io,
    net::{TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    error::{ConnectionError, Error, Result},
    protocol::{
        Protocol, ProtocolTransport,
        commands::{self, IsMaster},
    },
};

use super::{
    ClientOptions, ConnectionString, HostAddress, HostEntry, MemberState, ReadMode, ReadPreference,
    replica_set::ReplicaSetView,
    selection::{self, Member},
};

/// Owns one socket per host and decides which host serves each operation.
///
/// Without a replica-set name the manager talks to a single host: the first seed that accepts a
/// connection serves reads and writes alike. With one, it discovers the set from the seeds,
/// routes writes to the primary and reads according to a [`ReadPreference`].
///
/// The manager is not synchronized. Share it between threads only behind a lock.
pub struct ConnectionManager {
    seeds: Vec<HostAddress>,
    options: ClientOptions,
    hosts: BTreeMap<String, HostEntry>,
    connections: HashMap<String, Protocol>,
    primary: Option<String>,
    view: Option<ReplicaSetView>,
    /// Read preference key to the member it resolved to.
    resolved: HashMap<String, String>,
    rng: StdRng,
}

impl ConnectionManager {
    /// Parses `uri` and, unless `connect=false` was given, connects right away.
    pub fn new(uri: &str) -> Result<Self> {
        Self::from_connection_string(ConnectionString::parse(uri)?)
    }

    pub fn from_connection_string(connection_string: ConnectionString) -> Result<Self> {
        let ConnectionString { hosts, options } = connection_string;
        let auto_connect = options.auto_connect;

        let mut manager = Self {
            hosts: hosts
                .iter()
                .map(|address| (address.hash(), HostEntry::new(address.clone())))
                .collect(),
            seeds: hosts,
            options,
            connections: HashMap::new(),
            primary: None,
            view: None,
            resolved: HashMap::new(),
            rng: StdRng::from_entropy(),
        };

        if auto_connect {
            manager.connect()?;
        }
        Ok(manager)
    }

    /// Makes random member selection reproducible.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn is_replica_set(&self) -> bool {
        self.options.replica_set.is_some()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostEntry> {
        self.hosts.values()
    }

    pub fn host(&self, hash: &str) -> Option<&HostEntry> {
        self.hosts.get(hash)
    }

    pub fn replica_set_view(&self) -> Option<&ReplicaSetView> {
        self.view.as_ref()
    }

    pub fn primary_hash(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.is_replica_set() {
            self.bootstrap()
        } else {
            self.connect_single()
        }
    }

    /// Drops every socket and forgets the primary and all resolved read preferences. Host
    /// entries survive.
    pub fn close(&mut self) {
        info!("closing {} connections", self.connections.len());
        self.connections.clear();
        self.primary = None;
        self.view = None;
        self.resolved.clear();
    }

    /// Drops the socket to one host, typically after it timed out.
    pub fn discard(&mut self, hash: &str) {
        if self.connections.remove(hash).is_some() {
            debug!("discarded connection to {hash}");
        }
        self.resolved.retain(|_, member| member != hash);
    }

    /// The connection writes go to.
    pub fn write_protocol(&mut self) -> Result<&mut Protocol> {
        let hash = self.resolve_primary()?;
        self.protocol_for(&hash)
    }

    /// The connection a read under `preference` goes to.
    pub fn read_protocol(&mut self, preference: &ReadPreference) -> Result<&mut Protocol> {
        let hash = self.read_target(preference)?;
        self.protocol_for(&hash)
    }

    /// An open connection to `hash`, connecting first when there is none or the cached one is
    /// unusable.
    pub fn protocol_for(&mut self, hash: &str) -> Result<&mut Protocol> {
        self.ensure_connection(hash)?;
        self.connections
            .get_mut(hash)
            .ok_or_else(|| ConnectionError::NotConnected.into())
    }

    /// The cached connection to `hash`, if it exists and is usable. Never connects.
    pub fn connected_protocol(&mut self, hash: &str) -> Option<&mut Protocol> {
        self.connections.get_mut(hash).filter(|p| p.is_usable())
    }

    /// Measures the round-trip time to `hash` and records it on the host entry.
    pub fn ping(&mut self, hash: &str) -> Result<Duration> {
        let result = self.protocol_for(hash)?.ping();
        let rtt = match result {
            Ok(rtt) => rtt,
            Err(e) => {
                self.discard_if_unusable(hash);
                return Err(e);
            }
        };
        if let Some(entry) = self.hosts.get_mut(hash) {
            entry.record_ping(rtt);
        }
        Ok(rtt)
    }

    /// The member a read under `preference` goes to. Outside of `primary`, the answer is
    /// remembered per preference and reused for as long as that member stays reachable.
    pub fn read_target(&mut self, preference: &ReadPreference) -> Result<String> {
        if !self.is_replica_set() || preference.mode() == ReadMode::Primary {
            return self.resolve_primary();
        }

        let key = preference.key();
        if let Some(hash) = self.resolved.get(&key).cloned() {
            if self.ensure_connection(&hash).is_ok() {
                return Ok(hash);
            }
            debug!("{key} resolved to unreachable {hash}, selecting again");
            self.resolved.remove(&key);
        }

        let hash = match preference.mode() {
            ReadMode::Primary => self.resolve_primary()?,
            ReadMode::PrimaryPreferred => match self.resolve_primary() {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("primary unavailable for primaryPreferred read: {e}");
                    self.select_member(preference)?
                }
            },
            ReadMode::Secondary | ReadMode::Nearest => self.select_member(preference)?,
            ReadMode::SecondaryPreferred => match self.select_member(preference) {
                Ok(hash) => hash,
                Err(e) => {
                    debug!("no secondary for secondaryPreferred read ({e}), using primary");
                    self.resolve_primary()?
                }
            },
        };

        info!("read preference {key} resolved to {hash}");
        self.resolved.insert(key, hash.clone());
        Ok(hash)
    }

    fn resolve_primary(&mut self) -> Result<String> {
        if let Some(primary) = self.primary.clone() {
            match self.ensure_connection(&primary) {
                Ok(()) => return Ok(primary),
                Err(e) if !self.is_replica_set() => return Err(e),
                Err(e) => {
                    warn!("primary {primary} unreachable ({e}), rediscovering");
                    self.primary = None;
                }
            }
        }

        self.connect()?;
        let primary = self.primary.clone().ok_or(ConnectionError::NoPrimary)?;
        self.ensure_connection(&primary)?;
        Ok(primary)
    }

    fn connect_single(&mut self) -> Result<()> {
        let mut last = None;
        for seed in self.seeds.clone() {
            let hash = seed.hash();
            match self.ensure_connection(&hash) {
                Ok(()) => {
                    info!("connected to {hash}");
                    if let Some(entry) = self.hosts.get_mut(&hash) {
                        entry.state = MemberState::Primary;
                    }
                    self.primary = Some(hash);
                    return Ok(());
                }
                Err(e) => {
                    warn!("seed {hash} unreachable: {e}");
                    last = Some(e);
                }
            }
        }
        Err(seeds_exhausted(last))
    }

    /// Discovers the replica set from the first seed that answers, replaces the seed list with
    /// the members it reports and loads the status view from the primary.
    fn bootstrap(&mut self) -> Result<()> {
        let expected = self.options.replica_set.clone().unwrap_or_default();

        let mut last = None;
        let mut discovered = None;
        for seed in self.seeds.clone() {
            let hash = seed.hash();
            match self.is_master(&hash) {
                Ok(reply) => {
                    discovered = Some((hash, reply));
                    break;
                }
                Err(e) => {
                    warn!("seed {hash} unreachable: {e}");
                    last = Some(e);
                }
            }
        }
        let (seed, reply) = discovered.ok_or_else(|| seeds_exhausted(last))?;

        let found = reply.set_name.clone().unwrap_or_default();
        if found != expected {
            return Err(ConnectionError::ReplicaSetMismatch { expected, found }.into());
        }

        let primary = match (&reply.primary, reply.is_master) {
            (Some(primary), _) => primary.parse::<HostAddress>()?,
            (None, true) => seed.parse::<HostAddress>()?,
            (None, false) => return Err(ConnectionError::NoPrimary.into()),
        };
        let primary_hash = primary.hash();

        let mut hosts = BTreeMap::new();
        for member in reply.members() {
            match member.parse::<HostAddress>() {
                Ok(address) => {
                    hosts.insert(address.hash(), address);
                }
                Err(e) => warn!("ignoring member reported by {seed}: {e}"),
            }
        }
        hosts.insert(primary_hash.clone(), primary);

        self.ensure_connection(&primary_hash)?;

        self.seeds = hosts.values().cloned().collect();
        self.hosts = hosts
            .into_iter()
            .map(|(hash, address)| {
                let mut entry = HostEntry::new(address);
                if let Some(previous) = self.hosts.get(&hash) {
                    entry.healthy = previous.healthy;
                    entry.state = previous.state;
                    entry.ping = previous.ping;
                    entry.last_ping = previous.last_ping;
                }
                if hash == primary_hash {
                    entry.state = MemberState::Primary;
                    entry.healthy = true;
                }
                (hash, entry)
            })
            .collect();
        let hosts = &self.hosts;
        self.connections.retain(|hash, _| hosts.contains_key(hash));
        self.resolved.clear();

        info!(
            "replica set {expected}: primary {primary_hash}, {} members",
            self.hosts.len()
        );
        self.primary = Some(primary_hash);
        self.refresh_view(true)
    }

    fn is_master(&mut self, hash: &str) -> Result<IsMaster> {
        let reply = self
            .protocol_for(hash)?
            .run_command("admin", &commands::is_master())?;
        Ok(IsMaster::from_document(&reply))
    }

    /// Reloads member states and tags from the primary unless the cached view is still fresh.
    fn refresh_view(&mut self, force: bool) -> Result<()> {
        let primary = self.primary.clone().ok_or(ConnectionError::NoPrimary)?;
        let fresh = self
            .view
            .as_ref()
            .is_some_and(|view| view.is_fresh(&primary, Instant::now()));
        if fresh && !force {
            return Ok(());
        }

        let protocol = self.protocol_for(&primary)?;
        let status = protocol.run_command("admin", &commands::replica_set_status())?;
        let config = protocol.run_command("admin", &commands::replica_set_config())?;

        let hosts = &self.hosts;
        let view =
            ReplicaSetView::merge(&status, &config, &primary, |hash| hosts.contains_key(hash));
        debug!("refreshed replica set view from {primary}: {} members", view.len());
        self.view = Some(view);
        self.apply_view_states();
        Ok(())
    }

    /// Copies member states from the current view onto the host entries it knows about.
    fn apply_view_states(&mut self) {
        let Some(view) = &self.view else { return };
        for (hash, member) in view.members() {
            if let Some(entry) = self.hosts.get_mut(hash) {
                entry.state = member.state();
            }
        }
    }

    fn select_member(&mut self, preference: &ReadPreference) -> Result<String> {
        if self.primary.is_none() {
            if let Err(e) = self.connect() {
                if self.view.is_none() {
                    return Err(e);
                }
                warn!("rediscovery failed, selecting from the last view: {e}");
            }
        }
        if let Err(e) = self.refresh_view(false) {
            if self.view.is_none() {
                return Err(e);
            }
            warn!("using stale replica set view: {e}");
        }
        self.apply_view_states();

        let members: Vec<Member> = self
            .hosts
            .values()
            .map(|entry| Member {
                hash: entry.hash.clone(),
                state: entry.state,
                tags: self
                    .view
                    .as_ref()
                    .and_then(|view| view.member(&entry.hash))
                    .map(|member| member.tags.clone())
                    .unwrap_or_default(),
                ping: entry.ping,
            })
            .collect();

        let mode = preference.mode();
        let candidates = selection::eligible(members, mode.eligible_states());
        let candidates = selection::match_tagsets(candidates, preference.tagsets())?;

        let mut measured = Vec::with_capacity(candidates.len());
        for mut member in candidates {
            if member.ping.is_none() {
                match self.ping(&member.hash) {
                    Ok(rtt) => member.ping = Some(rtt),
                    Err(e) => {
                        warn!("skipping {}: {e}", member.hash);
                        continue;
                    }
                }
            }
            measured.push(member);
        }

        let chosen = selection::choose(&measured, mode, self.options.latency_window, &mut self.rng)
            .ok_or_else(|| selection::no_candidate(preference.tagsets()))?;
        info!("selected {} for {mode} read", chosen.hash);
        Ok(chosen.hash.clone())
    }

    fn ensure_connection(&mut self, hash: &str) -> Result<()> {
        if self.connections.get(hash).is_some_and(Protocol::is_usable) {
            return Ok(());
        }
        if self.connections.remove(hash).is_some() {
            debug!("reconnecting to {hash}");
        }

        let address = match self.hosts.get(hash) {
            Some(entry) => entry.address.clone(),
            None => hash.parse()?,
        };
        let stream = open_stream(&address, &self.options)?;
        if let Some(entry) = self.hosts.get_mut(hash) {
            entry.healthy = true;
        }

        let protocol = Protocol::new(ProtocolTransport::new(stream, hash))
            .with_timeout(self.options.socket_timeout)
            .with_write_concern(self.options.write_concern.clone());
        self.connections.insert(hash.to_string(), protocol);
        debug!("connected to {hash}");
        Ok(())
    }

    fn discard_if_unusable(&mut self, hash: &str) {
        if self.connections.get(hash).is_some_and(|p| !p.is_usable()) {
            self.discard(hash);
        }
    }
}

/// Resolves `address` and connects to the first socket address that accepts.
fn open_stream(address: &HostAddress, options: &ClientOptions) -> Result<TcpStream> {
    let host = address.hash();
    let socket_addrs = (address.host.as_str(), address.port)
        .to_socket_addrs()
        .map_err(|source| ConnectionError::Resolve {
            host: host.clone(),
            source,
        })?;

    let mut last_err = None;
    for socket_addr in socket_addrs {
        let attempt = if options.connect_timeout.is_zero() {
            TcpStream::connect(socket_addr)
        } else {
            TcpStream::connect_timeout(&socket_addr, options.connect_timeout)
        };
        match attempt {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_write_timeout(options.socket_timeout)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(ConnectionError::Connect {
        host,
        source: last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved")),
    }
    .into())
}

fn seeds_exhausted(last: Option<Error>) -> Error {
    ConnectionError::SeedsExhausted {
        last: last.map_or_else(|| "no seeds".to_string(), |e| e.to_string()),
    }
    .into()
}
