pub mod jwt;
pub mod middleware;

use crate::db::DbConnection;
use crate::error::{AppError, AppResult};
use crate::models::Device;
use diesel::prelude::*;

/// Header carrying a device's api key.
pub const ACCESS_TOKEN_HEADER: &str = "access-token";

pub fn authenticate_device(conn: &mut DbConnection, api_key: &str) -> AppResult<Device> {
    use crate::schema::devices::dsl;

    if api_key.is_empty() {
        return Err(AppError::Unauthorized);
    }

    dsl::devices
        .filter(dsl::api_key.eq(api_key))
        .select(Device::as_select())
        .first::<Device>(conn)
        .optional()?
        .ok_or(AppError::Unauthorized)
}

/// Random key for a newly registered device.
pub fn generate_api_key() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
