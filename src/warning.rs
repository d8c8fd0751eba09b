/// Blocked-page template. Placeholders are substituted, not format args, so
/// the markup can hold literal braces.
const WARNING_PAGE: &str = r#"<!DOCTYPE html>
<html>
    <head>
        <meta charset="utf-8">
        <title>Site Blocked by Phisherman</title>
        <style>
         body {
             background-color: #6d0000;
             color: white;
             font-family: sans-serif;
         }
         body * {
             text-align: center;
         }
         body strong {
             font-size: 20px;
         }
        </style>
    </head>
    <body>
        <h1>Site Blocked by Phisherman</h1>
        <p><strong>{{BLOCKED}}</strong> was detected to be a possible phishing site against
        <strong>{{MATCHED}}</strong> and was blocked
        <strong><em>(Algorithm {{ALGORITHM}}: {{SCORE}})</em></strong></p>
        <p>If you feel that this is a mistake, contact your system administrator
        to request that the site be unblocked.</p>
    </body>
</html>
"#;

/// Renders the warning page body for a detection.
pub fn warning_page(blocked: &str, matched: &str, algorithm: &str, score: i64) -> String {
    WARNING_PAGE
        .replace("{{BLOCKED}}", blocked)
        .replace("{{MATCHED}}", matched)
        .replace("{{ALGORITHM}}", algorithm)
        .replace("{{SCORE}}", &score.to_string())
}

/// Serializes a complete HTTP/1.1 response around an HTML body. Written
/// directly onto raw or TLS client streams.
pub fn html_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

/// Short plain-text diagnostic response for malformed requests and
/// infrastructure failures.
pub fn error_response(status: u16, reason: &str, message: &str) -> Vec<u8> {
    let body = format!("Phisherman: {message}\n");
    let mut out = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_page_names_all_detection_fields() {
        let page = warning_page("evil.net/login", "bank.com/login", "HTML", 42);
        assert!(page.contains("evil.net/login"));
        assert!(page.contains("bank.com/login"));
        assert!(page.contains("Algorithm HTML: 42"));
    }

    #[test]
    fn html_response_is_well_formed() {
        let body = warning_page("a.com/", "b.com/", "IMAGE", 50);
        let raw = html_response(503, "Service Unavailable", &body);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(text.ends_with(&body));
    }

    #[test]
    fn error_response_carries_diagnostic() {
        let raw = error_response(500, "Internal Server Error", "Unprocessable domain name");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 500"));
        assert!(text.contains("Phisherman: Unprocessable domain name"));
    }
}
