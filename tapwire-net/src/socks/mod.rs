mod parser;
mod reply;
mod types;

pub use parser::{SocksParseStatus, parse_greeting, parse_request};
pub use reply::{build_method_selection, build_reply};
pub use types::{
    METHOD_NO_AUTH, METHOD_NONE_ACCEPTABLE, SOCKS5_VERSION, SocksAddress, SocksCommand,
    SocksError, SocksErrorKind, SocksGreeting, SocksReply, SocksRequest,
};
