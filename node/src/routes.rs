//! Provisioning endpoints.

use tracing::{info, warn};
use webnode_common::{
    http::JSON_CONTENT_TYPE, HttpError, Method, Request, ScanResult, Value, WifiConfig, WifiMode,
};

use crate::{
    http::{HandlerFuture, Response, Router},
    supervisor::SupervisorHandle,
    wifi::ConnectivityHandle,
};

pub struct AppState {
    pub connectivity: ConnectivityHandle,
    pub supervisor: SupervisorHandle,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/wifi_scan", Method::Get, wifi_scan)
        .route("/wifi_mode", Method::Get, wifi_mode)
        .route("/set_config", Method::Get, set_config_form)
        .route("/set_config", Method::Post, set_config)
}

fn wifi_scan<'a>(app: &'a AppState, _: &'a Request, resp: &'a mut Response) -> HandlerFuture<'a> {
    Box::pin(async move {
        let results = app
            .supervisor
            .scan()
            .await
            .map_err(|err| HttpError::internal(format!("WiFi scan failed: {err:#}")))?;
        let current = app.connectivity.snapshot();
        let current_ssid = current
            .is_mode(WifiMode::Station)
            .then_some(current.ssid)
            .flatten();

        resp.header("content-type", JSON_CONTENT_TYPE);
        resp.set_json(Value::List(
            results
                .iter()
                .map(|result| scan_entry(result, current_ssid.as_deref()))
                .collect(),
        ))
    })
}

fn scan_entry(result: &ScanResult, current_ssid: Option<&str>) -> Value {
    Value::object([
        ("ssid", Value::from(result.ssid.as_str())),
        ("bssid", Value::from(result.bssid_str())),
        ("channel", Value::from(result.channel)),
        ("rssi", Value::from(result.rssi)),
        ("authmode", Value::from(result.auth.as_str())),
        ("hidden", Value::from(result.hidden)),
        ("connected", Value::from(current_ssid == Some(result.ssid.as_str()))),
    ])
}

fn wifi_mode<'a>(app: &'a AppState, _: &'a Request, resp: &'a mut Response) -> HandlerFuture<'a> {
    Box::pin(async move {
        let state = app.connectivity.snapshot();
        resp.header("content-type", JSON_CONTENT_TYPE);
        resp.set_json(Value::object([("mode", Value::from(state.mode_str()))]))
    })
}

fn set_config_form<'a>(
    app: &'a AppState,
    _: &'a Request,
    resp: &'a mut Response,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let state = app.connectivity.snapshot();
        let current_ssid = state.ssid.clone().unwrap_or_default();
        let ssid = if state.is_mode(WifiMode::Station) {
            current_ssid.as_str()
        } else {
            ""
        };

        resp.header("content-type", "text/html");
        resp.append_body("<!DOCTYPE html><html><head><title>WiFi setup</title></head><body>")?;
        resp.append_body(&format!(
            "<p>Current mode: {} {}</p>",
            state.mode_str(),
            escape_attr(&current_ssid)
        ))?;
        resp.append_body(r#"<form method="post" action="/set_config">"#)?;
        resp.append_body(
            r#"<label><input type="radio" name="mode" value="ap"> Access point</label><br>"#,
        )?;
        resp.append_body(
            r#"<label><input type="radio" name="mode" value="sta" checked> Station</label><br>"#,
        )?;
        resp.append_body(&format!(
            r#"<label>SSID <input name="ssid" value="{}"></label><br>"#,
            escape_attr(ssid)
        ))?;
        resp.append_body(r#"<label>Password <input name="pass" type="password"></label><br>"#)?;
        resp.append_body(r#"<button type="submit">Apply</button></form></body></html>"#)
    })
}

fn set_config<'a>(app: &'a AppState, req: &'a Request, resp: &'a mut Response) -> HandlerFuture<'a> {
    Box::pin(async move {
        let mode = req
            .form("mode")
            .ok_or_else(|| HttpError::bad_request("No mode given."))?;
        let current = app.connectivity.snapshot();

        let config = match mode {
            "ap" => {
                if current.is_mode(WifiMode::AccessPoint) {
                    return status_report(resp, "Not modified.");
                }
                WifiConfig::AccessPoint
            }
            "sta" => {
                let (Some(ssid), Some(password)) = (req.form("ssid"), req.form("pass")) else {
                    return Err(HttpError::bad_request(
                        "STA mode requires both ssid and pass.",
                    ));
                };
                if current.is_mode(WifiMode::Station) && current.ssid.as_deref() == Some(ssid) {
                    return status_report(resp, "Not modified.");
                }
                WifiConfig::Station {
                    ssid: ssid.to_string(),
                    password: password.to_string(),
                }
            }
            _ => return Err(HttpError::bad_request("Wrong mode given.")),
        };

        let message = match &config {
            WifiConfig::AccessPoint => "Starting AP.".to_string(),
            WifiConfig::Station { ssid, .. } => format!("Starting STA mode, ssid={ssid}."),
        };
        info!("{message}");
        status_report(resp, &message)?;

        // The client gets its answer before the services go down.
        resp.send().await?;

        match app.supervisor.apply(config).await {
            Ok(outcome) => info!("mode change finished: {outcome:?}"),
            Err(err) => warn!("mode change failed: {err:#}"),
        }
        Ok(())
    })
}

fn status_report(resp: &mut Response, message: &str) -> Result<(), HttpError> {
    resp.header("content-type", JSON_CONTENT_TYPE);
    resp.set_json(Value::object([
        ("status", Value::from("ok")),
        ("message", Value::from(message)),
    ]))
}

fn escape_attr(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
