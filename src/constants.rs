/// Capability an agent advertises to receive document fetch deliveries
pub const DOCUMENT_FETCH_CAPABILITY: &str = "document_fetch";

/// Envelope kind for document fetches
pub const DOCUMENT_FETCH_KIND: &str = "document_fetch";

/// Default address the server listens on
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Default SQLite file for the task store
pub const DEFAULT_DATABASE_PATH: &str = "tasklink.db";

/// Default broker URL agents connect to
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

/// Directory under the platform config dir holding `server.yaml` / `agent.yaml`
pub const CONFIG_DIR_NAME: &str = "tasklink";

pub const DATABASE_PATH_ENV: &str = "TASKLINK_DATABASE_PATH";
pub const SERVER_URL_ENV: &str = "TASKLINK_SERVER_URL";

/// Upper bound on tasks returned by `GET /tasks`
pub const MAX_TASK_LIST_LIMIT: i64 = 500;
pub const DEFAULT_TASK_LIST_LIMIT: i64 = 50;

/// Tasks the orchestrator picks up per poll
pub const ORCHESTRATOR_BATCH_SIZE: i64 = 16;

/// Characters kept in a document analysis excerpt
pub const EXCERPT_CHARS: usize = 280;

/// Keywords reported by the text analyzer
pub const TOP_KEYWORDS: usize = 10;
