use crate::server::config::ServerConfig;
use std::time::Duration;
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct University {
    pub name: String,
    pub country_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Country {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub text: String,
    pub author: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Weather {
    pub temperature_c: f64,
    pub wind_speed_kmh: f64,
}

fn http_client(config: &ServerConfig) -> Option<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.content_api_timeout_secs))
        .build()
        .ok()
}

/// Static per-country lists served whenever the directory API is down or
/// returns nothing.
pub fn fallback_universities(country_code: &str) -> Vec<University> {
    let names: &[&str] = match country_code {
        "RW" => &[
            "University of Rwanda",
            "African Leadership University",
            "Carnegie Mellon University Africa",
            "University of Kigali",
        ],
        "KE" => &["University of Nairobi", "Kenyatta University", "Strathmore University"],
        "UG" => &["Makerere University", "Kyambogo University"],
        _ => &["Massachusetts Institute of Technology", "University of Oxford", "ETH Zurich"],
    };
    names.iter()
        .map(|name| University { name: name.to_string(), country_code: country_code.to_string() })
        .collect()
}

pub async fn load_universities(config: &ServerConfig, country_code: &str) -> Vec<University> {
    #[derive(Deserialize)]
    struct ApiRecord {
        name: String,
        #[serde(default)]
        alpha_two_code: String,
    }

    let client = match http_client(config) {
        Some(client) => client,
        None => return fallback_universities(country_code),
    };
    let url = format!("{}?country={}", config.university_api_url, country_code);
    let records: Vec<ApiRecord> = match client.get(&url).send().await {
        Ok(response) => match response.json().await {
            Ok(records) => records,
            Err(e) => {
                println!("[CONTENT] University API returned bad payload: {}", e);
                return fallback_universities(country_code);
            }
        },
        Err(e) => {
            println!("[CONTENT] University API unreachable: {}", e);
            return fallback_universities(country_code);
        }
    };
    if records.is_empty() {
        return fallback_universities(country_code);
    }
    records.into_iter()
        .map(|r| University {
            name: r.name,
            country_code: if r.alpha_two_code.is_empty() { country_code.to_string() } else { r.alpha_two_code },
        })
        .collect()
}

pub fn fallback_countries() -> Vec<Country> {
    [
        ("Rwanda", "RW"),
        ("Kenya", "KE"),
        ("Uganda", "UG"),
        ("Tanzania", "TZ"),
        ("Nigeria", "NG"),
        ("Ghana", "GH"),
        ("South Africa", "ZA"),
        ("United States", "US"),
        ("United Kingdom", "GB"),
        ("Germany", "DE"),
    ]
    .iter()
    .map(|(name, code)| Country { name: name.to_string(), code: code.to_string() })
    .collect()
}

pub async fn load_countries(config: &ServerConfig) -> Vec<Country> {
    let client = match http_client(config) {
        Some(client) => client,
        None => return fallback_countries(),
    };
    let payload: Vec<serde_json::Value> = match client.get(&config.country_api_url).send().await {
        Ok(response) => match response.json().await {
            Ok(payload) => payload,
            Err(e) => {
                println!("[CONTENT] Country API returned bad payload: {}", e);
                return fallback_countries();
            }
        },
        Err(e) => {
            println!("[CONTENT] Country API unreachable: {}", e);
            return fallback_countries();
        }
    };
    let mut countries: Vec<Country> = payload.iter()
        .filter_map(|entry| {
            let name = entry.get("name")?.get("common")?.as_str()?;
            let code = entry.get("cca2")?.as_str()?;
            Some(Country { name: name.to_string(), code: code.to_string() })
        })
        .collect();
    if countries.is_empty() {
        return fallback_countries();
    }
    countries.sort_by(|a, b| a.name.cmp(&b.name));
    countries
}

pub fn fallback_quote() -> Quote {
    Quote {
        text: "The beautiful thing about learning is that nobody can take it away from you.".to_string(),
        author: "B.B. King".to_string(),
    }
}

pub async fn daily_quote(config: &ServerConfig) -> Quote {
    #[derive(Deserialize)]
    struct ApiQuote {
        content: String,
        author: String,
    }

    let client = match http_client(config) {
        Some(client) => client,
        None => return fallback_quote(),
    };
    match client.get(&config.quote_api_url).send().await {
        Ok(response) => match response.json::<ApiQuote>().await {
            Ok(quote) => Quote { text: quote.content, author: quote.author },
            Err(e) => {
                println!("[CONTENT] Quote API returned bad payload: {}", e);
                fallback_quote()
            }
        },
        Err(e) => {
            println!("[CONTENT] Quote API unreachable: {}", e);
            fallback_quote()
        }
    }
}

pub fn fallback_weather() -> Weather {
    Weather { temperature_c: 21.0, wind_speed_kmh: 8.0 }
}

pub async fn current_weather(config: &ServerConfig, latitude: f64, longitude: f64) -> Weather {
    #[derive(Deserialize)]
    struct ApiCurrent {
        temperature: f64,
        windspeed: f64,
    }
    #[derive(Deserialize)]
    struct ApiResponse {
        current_weather: ApiCurrent,
    }

    let client = match http_client(config) {
        Some(client) => client,
        None => return fallback_weather(),
    };
    let url = format!("{}?latitude={}&longitude={}&current_weather=true", config.weather_api_url, latitude, longitude);
    match client.get(&url).send().await {
        Ok(response) => match response.json::<ApiResponse>().await {
            Ok(payload) => Weather {
                temperature_c: payload.current_weather.temperature,
                wind_speed_kmh: payload.current_weather.windspeed,
            },
            Err(e) => {
                println!("[CONTENT] Weather API returned bad payload: {}", e);
                fallback_weather()
            }
        },
        Err(e) => {
            println!("[CONTENT] Weather API unreachable: {}", e);
            fallback_weather()
        }
    }
}

pub async fn detect_timezone(config: &ServerConfig) -> String {
    #[derive(Deserialize)]
    struct ApiResponse {
        timezone: String,
    }

    let client = match http_client(config) {
        Some(client) => client,
        None => return "UTC".to_string(),
    };
    match client.get(&config.timezone_api_url).send().await {
        Ok(response) => match response.json::<ApiResponse>().await {
            Ok(payload) => payload.timezone,
            Err(_) => "UTC".to_string(),
        },
        Err(e) => {
            println!("[CONTENT] Timezone API unreachable: {}", e);
            "UTC".to_string()
        }
    }
}

pub async fn universities_command(config: &ServerConfig, country_code: &str) -> String {
    let universities = load_universities(config, country_code).await;
    match serde_json::to_string(&universities) {
        Ok(json) => format!("OK: {}", json),
        Err(e) => format!("ERR: {}", e),
    }
}

pub async fn countries_command(config: &ServerConfig) -> String {
    let countries = load_countries(config).await;
    match serde_json::to_string(&countries) {
        Ok(json) => format!("OK: {}", json),
        Err(e) => format!("ERR: {}", e),
    }
}

pub async fn quote_command(config: &ServerConfig) -> String {
    let quote = daily_quote(config).await;
    match serde_json::to_string(&quote) {
        Ok(json) => format!("OK: {}", json),
        Err(e) => format!("ERR: {}", e),
    }
}

pub async fn weather_command(config: &ServerConfig, latitude: f64, longitude: f64) -> String {
    let weather = current_weather(config, latitude, longitude).await;
    match serde_json::to_string(&weather) {
        Ok(json) => format!("OK: {}", json),
        Err(e) => format!("ERR: {}", e),
    }
}

pub async fn timezone_command(config: &ServerConfig) -> String {
    format!("OK: {}", detect_timezone(config).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> ServerConfig {
        let mut config = ServerConfig::from_env();
        config.university_api_url = "http://127.0.0.1:1/search".to_string();
        config.country_api_url = "http://127.0.0.1:1/countries".to_string();
        config.quote_api_url = "http://127.0.0.1:1/quote".to_string();
        config.weather_api_url = "http://127.0.0.1:1/weather".to_string();
        config.timezone_api_url = "http://127.0.0.1:1/tz".to_string();
        config.content_api_timeout_secs = 1;
        config
    }

    #[test]
    fn rwanda_fallback_has_exactly_four_universities() {
        let universities = fallback_universities("RW");
        assert_eq!(universities.len(), 4);
        assert_eq!(universities[0].name, "University of Rwanda");
        assert!(universities.iter().all(|u| u.country_code == "RW"));
    }

    #[tokio::test]
    async fn unreachable_university_api_degrades_to_fallback() {
        let config = unreachable_config();
        let universities = load_universities(&config, "RW").await;
        assert_eq!(universities, fallback_universities("RW"));
    }

    #[tokio::test]
    async fn unreachable_country_api_degrades_to_fallback() {
        let config = unreachable_config();
        let countries = load_countries(&config).await;
        assert_eq!(countries, fallback_countries());
        assert!(countries.iter().any(|c| c.code == "RW"));
    }

    #[tokio::test]
    async fn unreachable_quote_and_weather_apis_return_canned_data() {
        let config = unreachable_config();
        let quote = daily_quote(&config).await;
        assert_eq!(quote.author, "B.B. King");
        let weather = current_weather(&config, -1.95, 30.06).await;
        assert_eq!(weather.temperature_c, 21.0);
        assert_eq!(detect_timezone(&config).await, "UTC");
    }
}
