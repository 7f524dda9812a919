mod acceptor;
mod connection;
mod meta;
mod procedure;
mod pub_sub;
mod realm;
mod router;
mod rpc;
mod session;
mod topic;

pub use acceptor::{
    Acceptance,
    Acceptor,
    AcceptorFactory,
    WebSocketAcceptorFactory,
};
pub use meta::is_meta_uri;
pub use procedure::{
    Callee,
    Participant,
    ProcedureManager,
    Registration,
};
pub use realm::{
    Realm,
    RealmConfig,
    RealmManager,
    RealmSession,
    SessionInfo,
};
pub use router::{
    DirectConnection,
    Router,
    RouterConfig,
    RouterContext,
    RouterHandle,
    WebSocketRouter,
    new_web_socket_router,
};
pub use rpc::Invocation;
pub use session::SessionHandle;
pub use topic::{
    Subscriber,
    Subscription,
    TopicManager,
};
