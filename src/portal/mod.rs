//! ポータル (Tampereen Energia) モジュール
//!
//! ヘッドレスブラウザでログインし、SPAが発行する内部API呼び出しを捕捉して、
//! 以降はHTTPで直接リプレイする。

mod fetcher;
mod session;
mod types;

pub use fetcher::HttpDataFetcher;
pub use session::ChromiumSessionBroker;
pub use types::{is_data_request, SessionContext, SessionCookie};
