//! Tests for the request/response model
//!
//! These cover query and form parsing, header case-insensitivity, body
//! exclusivity on the response and content-disposition rendering.

#[cfg(test)]
mod tests {
    use super::super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn form_request(content_type: &str, body: &str) -> RequestModel {
        let headers: HeaderMap = [("Content-Type", content_type)].into_iter().collect();
        RequestModel::from_parts("post", "/submit", None, headers, Bytes::from(body.to_string()))
    }

    #[test]
    fn test_query_last_value_wins() {
        let req = RequestModel::from_parts(
            "GET",
            "/search",
            Some("q=first&page=2&q=second"),
            HeaderMap::new(),
            Bytes::new(),
        );
        assert_eq!(req.query_value("q"), Some("second"));
        assert_eq!(req.query_value("page"), Some("2"));
        assert_eq!(req.query_value("missing"), None);
    }

    #[test]
    fn test_query_is_percent_decoded() {
        let req = RequestModel::from_parts("GET", "/", Some("name=J%C3%BCrgen+Smith"), HeaderMap::new(), Bytes::new());
        assert_eq!(req.query_value("name"), Some("Jürgen Smith"));
    }

    #[test]
    fn test_method_is_uppercased() {
        let req = RequestModel::new("get", "/");
        assert_eq!(req.method(), "GET");
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let headers: HeaderMap = [("X-Custom", "one"), ("Accept", "text/html")].into_iter().collect();
        let req = RequestModel::from_parts("GET", "/", None, headers, Bytes::new());
        assert_eq!(req.header("x-custom"), Some("one"));
        assert_eq!(req.header("X-CUSTOM"), Some("one"));
        assert_eq!(req.header("accept"), Some("text/html"));
    }

    #[test]
    fn test_repeated_headers_are_joined() {
        let headers: HeaderMap = [("Via", "a"), ("via", "b")].into_iter().collect();
        assert_eq!(headers.get("VIA"), Some("a, b"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_url_encoded_form_aggregates_repeated_keys() {
        let req = form_request("application/x-www-form-urlencoded", "foo=bar&baz=1&baz=2");
        let form = req.form().expect("form should be parsed");
        assert_eq!(form.get("foo").map(String::as_str), Some("bar"));
        assert_eq!(form.get("baz").map(String::as_str), Some("1,2"));
        assert_eq!(req.body(), "foo=bar&baz=1&baz=2");
    }

    #[test]
    fn test_form_with_charset_parameter() {
        let req = form_request("application/x-www-form-urlencoded; charset=utf-8", "a=1");
        assert_eq!(req.form().unwrap().get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_form_not_parsed_for_json() {
        let req = form_request("application/json", r#"{"foo":"bar"}"#);
        assert!(req.form().is_none());
        assert_eq!(req.body(), r#"{"foo":"bar"}"#);
    }

    #[tokio::test]
    async fn test_multipart_form_fields() {
        let body = "--XyZ\r\n\
            Content-Disposition: form-data; name=\"title\"\r\n\r\n\
            hello world\r\n\
            --XyZ\r\n\
            Content-Disposition: form-data; name=\"tag\"\r\n\r\n\
            a\r\n\
            --XyZ\r\n\
            Content-Disposition: form-data; name=\"tag\"\r\n\r\n\
            b\r\n\
            --XyZ\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"x.bin\"\r\n\
            Content-Type: application/octet-stream\r\n\r\n\
            binary\r\n\
            --XyZ--\r\n";
        let form = request::parse_multipart_form("multipart/form-data; boundary=XyZ", Bytes::from(body))
            .await
            .unwrap();
        assert_eq!(form.get("title").map(String::as_str), Some("hello world"));
        assert_eq!(form.get("tag").map(String::as_str), Some("a,b"));
        assert!(form.get("upload").is_none());
    }

    #[tokio::test]
    async fn test_multipart_extended_filename_is_an_upload() {
        let body = "--b\r\n\
            Content-Disposition: form-data; name=\"a\"\r\n\r\n\
            1\r\n\
            --b\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename*=UTF-8''r%C3%A9sum%C3%A9.txt\r\n\
            Content-Type: text/plain\r\n\r\n\
            FILEBYTES\r\n\
            --b--\r\n";
        let form = request::parse_multipart_form("multipart/form-data; boundary=b", Bytes::from(body))
            .await
            .unwrap();
        assert_eq!(form.len(), 1);
        assert_eq!(form.get("a").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_multipart_quoted_name_keeps_semicolon() {
        let body = "--b\r\n\
            Content-Disposition: form-data; name=\"a;b\"\r\n\r\n\
            kept\r\n\
            --b--\r\n";
        let form = request::parse_multipart_form("multipart/form-data; boundary=\"b\"", Bytes::from(body))
            .await
            .unwrap();
        assert_eq!(form.get("a;b").map(String::as_str), Some("kept"));
    }

    #[tokio::test]
    async fn test_multipart_without_boundary_is_rejected() {
        let err = request::parse_multipart_form("multipart/form-data", Bytes::from("x"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), hyper::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_multipart_is_not_parsed_synchronously() {
        let req = form_request("multipart/form-data; boundary=XyZ", "--XyZ--\r\n");
        assert!(req.form().is_none());
    }

    #[test]
    fn test_request_script_value_shape() {
        let headers: HeaderMap = [("Content-Type", "text/plain")].into_iter().collect();
        let req = RequestModel::from_parts("GET", "/hello", Some("name=kr"), headers, Bytes::from("hi"))
            .with_route_values([("id".to_string(), "7".to_string())].into_iter().collect());
        let value = req.to_script_value();
        assert_eq!(value["Method"], "GET");
        assert_eq!(value["Path"], "/hello");
        assert_eq!(value["Query"]["name"], "kr");
        assert_eq!(value["Headers"]["content-type"], "text/plain");
        assert_eq!(value["Body"], "hi");
        assert_eq!(value["RouteValues"]["id"], "7");
        assert!(value["Form"].is_null());
        assert!(value.get("RawBody").is_none());
    }

    #[test]
    fn test_response_defaults() {
        let res = ResponseModel::new();
        assert_eq!(res.status(), 200);
        assert!(res.body().is_absent());
        assert!(res.content_type().is_none());
        assert!(res.redirect().is_none());
    }

    #[test]
    fn test_binary_write_replaces_text() {
        let mut res = ResponseModel::new();
        res.write_text("hello", None);
        res.write_binary(vec![1u8, 2, 3], None);
        match res.body() {
            ResponseBody::Binary(bytes) => assert_eq!(bytes.as_ref(), &[1, 2, 3]),
            other => panic!("expected binary body, got {:?}", other),
        }
        assert_eq!(res.content_type(), Some("application/octet-stream"));
    }

    #[test]
    fn test_json_write() {
        let mut res = ResponseModel::new();
        res.write_json(&json!({"Body": "Hello"}));
        assert_eq!(res.content_type(), Some("application/json"));
        match res.body() {
            ResponseBody::Text(text) => assert_eq!(text, r#"{"Body":"Hello"}"#),
            other => panic!("expected text body, got {:?}", other),
        }
    }

    #[test]
    fn test_redirect_defaults_to_302() {
        let mut res = ResponseModel::new();
        res.write_redirect("https://example.com/next", None, None);
        assert_eq!(res.effective_status(), 302);
        assert_eq!(res.redirect().unwrap().url, "https://example.com/next");
        assert!(res.body().is_absent());
    }

    #[test]
    fn test_redirect_with_custom_status_and_message() {
        let mut res = ResponseModel::new();
        res.write_redirect("/moved", Some(301), Some("Moved"));
        assert_eq!(res.effective_status(), 301);
        assert_eq!(res.status(), 200);
        assert!(matches!(res.body(), ResponseBody::Text(t) if t == "Moved"));
    }

    #[test]
    fn test_content_disposition_rendering() {
        assert_eq!(ContentDisposition::default().header_value(), None);
        assert_eq!(
            ContentDisposition::new(DispositionType::Inline, None).header_value().as_deref(),
            Some("inline")
        );
        assert_eq!(
            ContentDisposition::new(DispositionType::Attachment, Some("my report.pdf".into()))
                .header_value()
                .as_deref(),
            Some("attachment; filename=\"my%20report.pdf\"")
        );
        assert_eq!(
            ContentDisposition::new(DispositionType::Attachment, Some("a&b=c.txt".into()))
                .header_value()
                .as_deref(),
            Some("attachment; filename=\"a%26b%3Dc.txt\"")
        );
    }

    #[test]
    fn test_script_state_round_trip_keeps_stream() {
        let mut res = ResponseModel::new();
        let stream = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from("chunk"))]);
        res.write_stream(Box::pin(stream), Some("text/event-stream"));

        let mut state = res.to_script_state();
        assert_eq!(state.body, Some(ScriptBody::Stream));
        state.status = 201;
        state.headers.insert("X-Trace".into(), "abc".into());
        res.apply_script_state(state);

        assert_eq!(res.status(), 201);
        assert_eq!(res.headers().get("x-trace"), Some("abc"));
        assert_eq!(res.body().kind(), "stream");
    }

    #[test]
    fn test_script_state_from_json() {
        let state: ScriptResponseState = serde_json::from_value(json!({
            "status": 404,
            "content_type": "text/plain",
            "headers": {"X-A": "1"},
            "body": {"kind": "text", "text": "nope"},
            "content_disposition": {"kind": "attachment", "file_name": "a.txt"}
        }))
        .unwrap();

        let mut res = ResponseModel::new();
        res.apply_script_state(state);
        assert_eq!(res.status(), 404);
        assert!(matches!(res.body(), ResponseBody::Text(t) if t == "nope"));
        assert_eq!(res.content_disposition().kind, DispositionType::Attachment);
    }

    #[test]
    fn test_text_based_classification() {
        assert!(mime::is_text_based("text/html"));
        assert!(mime::is_text_based("text/plain; charset=latin1"));
        assert!(mime::is_text_based("application/json"));
        assert!(mime::is_text_based("APPLICATION/XML"));
        assert!(mime::is_text_based("application/yaml"));
        assert!(mime::is_text_based("application/problem+json"));
        assert!(mime::is_text_based("application/atom+xml"));
        assert!(!mime::is_text_based("application/octet-stream"));
        assert!(!mime::is_text_based("image/png"));
        assert!(!mime::is_text_based(""));
    }

    #[test]
    fn test_charset_appending() {
        assert_eq!(mime::with_utf8_charset("text/plain"), "text/plain; charset=utf-8");
        assert_eq!(mime::with_utf8_charset("text/plain; charset=latin1"), "text/plain; charset=latin1");
        assert_eq!(mime::with_utf8_charset("image/png"), "image/png");
    }

    #[test]
    fn test_mime_parameters_respect_quotes() {
        let params = mime::parameters(r#"form-data; name="a;b"; filename*=UTF-8''x.txt; note="say \"hi\"""#);
        assert_eq!(
            params,
            vec![
                ("name".to_string(), "a;b".to_string()),
                ("filename*".to_string(), "UTF-8''x.txt".to_string()),
                ("note".to_string(), "say \"hi\"".to_string()),
            ]
        );
        assert!(mime::parameters("form-data").is_empty());
        assert_eq!(mime::parameter("text/plain; CHARSET=latin1", "charset").as_deref(), Some("latin1"));
    }

    #[test]
    fn test_mime_parameter() {
        assert_eq!(
            mime::parameter("multipart/form-data; boundary=\"abc\"", "boundary").as_deref(),
            Some("abc")
        );
        assert_eq!(mime::parameter("text/plain", "charset"), None);
    }
}
