use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub max_clients: usize,
    pub log_level: String,
    pub session_expiry_days: u32,
    pub argon2_salt_length: u32,
    pub max_message_length: usize,
    pub admin_email: String,
    pub admin_password: String,
    pub admin_name: String,
    pub university_api_url: String,
    pub country_api_url: String,
    pub quote_api_url: String,
    pub weather_api_url: String,
    pub timezone_api_url: String,
    pub content_api_timeout_secs: u64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5000),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:data/studylink.db".to_string()),
            max_clients: env::var("MAX_CLIENTS").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            session_expiry_days: env::var("SESSION_EXPIRY_DAYS").ok().and_then(|v| v.parse().ok()).unwrap_or(7),
            argon2_salt_length: env::var("ARGON2_SALT_LENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(16),
            max_message_length: env::var("MAX_MESSAGE_LENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(2048),
            // Single admin account, same model as the original dashboard login
            admin_email: env::var("ADMIN_EMAIL").unwrap_or_else(|_| "admin@studylink.app".to_string()),
            admin_password: env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin123".to_string()),
            admin_name: env::var("ADMIN_NAME").unwrap_or_else(|_| "StudyLink Admin".to_string()),
            university_api_url: env::var("UNIVERSITY_API_URL")
                .unwrap_or_else(|_| "http://universities.hipolabs.com/search".to_string()),
            country_api_url: env::var("COUNTRY_API_URL")
                .unwrap_or_else(|_| "https://restcountries.com/v3.1/all?fields=name,cca2".to_string()),
            quote_api_url: env::var("QUOTE_API_URL")
                .unwrap_or_else(|_| "https://api.quotable.io/random".to_string()),
            weather_api_url: env::var("WEATHER_API_URL")
                .unwrap_or_else(|_| "https://api.open-meteo.com/v1/forecast".to_string()),
            timezone_api_url: env::var("TIMEZONE_API_URL")
                .unwrap_or_else(|_| "http://worldtimeapi.org/api/ip".to_string()),
            content_api_timeout_secs: env::var("CONTENT_API_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
        }
    }
}
