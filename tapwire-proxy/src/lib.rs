mod breakpoint;
mod config;
mod context;
mod error;
mod events;
mod exchange;
mod orchestrator;
mod pool;
mod proxy;
mod rules;
mod sniff;
mod upstream;
mod wire;

#[cfg(test)]
mod exchange_test;
#[cfg(test)]
mod sniff_test;
#[cfg(test)]
mod upstream_test;

pub use breakpoint::{
    BodyEdit, BreakPointContext, BreakPointEvent, BreakPointLocation, BreakPointManager,
    BreakPointModel, BreakPointStatus, ConnectionSetupModel, EditError, RequestEditModel,
    ResponseEditModel,
};
pub use config::{
    ArchiveConfig, LimitsConfig, ListenConfig, PoolConfig, ProxyConfig, TlsMitmConfig,
};
pub use context::{ExchangeContext, HeaderAlteration, PreMadeResponse};
pub use error::{ActionError, PoolError, ProxyError};
pub use events::{BreakPointEvents, event_channel};
pub use exchange::{
    Authority, Body, ByteStream, Connection, Exchange, Metrics, Request, Response, Upgraded,
    resolve_agent,
};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use pool::{
    ConnectionPool, DowngradeTlsPolicy, NoRequalification, PoolProvider, RequalificationPolicy,
    send_with_retry,
};
pub use proxy::Proxy;
pub use rules::{
    Action, Filter, FilterScope, ResponseBody, Rule, RuleEngine, RuleFileError, RuleSet,
    StringOperation, StringSelector, load_rules, parse_rules,
};
pub use sniff::{
    CaCertificateProvider, CertificateProvider, Replay, StreamKind, TlsImpersonator, classify,
    sniff,
};
pub use upstream::{Http11PoolProvider, UpstreamSettings};
pub use wire::MessageStream;
