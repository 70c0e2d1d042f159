mod admin_api;

pub use admin_api::{
    router, AdminApi, AdminState, BufferSizeResponse, LoggingRequest, LoggingResponse,
};
