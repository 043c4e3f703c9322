use http::header::CONTENT_ENCODING;
use http::{HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use sprout_web::filter::filter_fn;
use sprout_web::router::Router;
use sprout_web::session::{RequestSession, SessionConfig};
use sprout_web::{RouterError, Server, StatusError, WebConfig, handler_fn};
use std::env;
use tracing::info;

#[derive(Deserialize, Serialize, Debug)]
pub struct User {
    name: String,
    zip: String,
}

fn routes() -> Result<Router, RouterError> {
    let mut router = Router::new();

    // curl -v http://127.0.0.1:8080/
    router.get(
        "/",
        handler_fn(|request, response| {
            response.set_body(format!("receive from method: {}\r\n", request.method()));
            Ok(())
        }),
    )?;

    router.path("/api", |api| {
        // curl -v -H 'Content-Type: application/json' -d '{"name":"hello","zip":"world"}' http://127.0.0.1:8080/api/users
        api.post(
            "/users",
            handler_fn(|request, response| {
                let user: User = request.json().map_err(StatusError::bad_request)?;
                info!(?user, "user received");
                response.set_status(StatusCode::CREATED);
                response.json(&user)?;
                Ok(())
            }),
        )?;

        // curl -v http://127.0.0.1:8080/api/users/42
        api.get(
            "/users/:id",
            handler_fn(|request, response| {
                let id = request.path_param("id").unwrap_or_default();
                response.json(&User { name: format!("user-{id}"), zip: "00000".into() })?;
                Ok(())
            }),
        )?;

        // curl -v --compressed http://127.0.0.1:8080/api/report
        api.get(
            "/report",
            handler_fn(|_, response| {
                response.set_body("a long report ".repeat(64));
                response.insert_header(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                Ok(())
            }),
        )?;
        Ok(())
    })?;

    // curl -v -c cookies -b cookies http://127.0.0.1:8080/visits
    router.get(
        "/visits",
        handler_fn(|request, response| {
            let session = request.session().ok_or("sessions are disabled")?;
            let visits = session.get::<u64>("visits").unwrap_or(0) + 1;
            session.put("visits", &visits)?;
            response.set_body(format!("visit #{visits}\r\n"));
            Ok(())
        }),
    )?;

    // curl -v http://127.0.0.1:8080/old
    router.get(
        "/old",
        handler_fn(|_, response| {
            response.redirect("/", StatusCode::MOVED_PERMANENTLY)?;
            Ok(())
        }),
    )?;

    router.before_for(
        "/api/*",
        Some(Method::POST),
        None,
        filter_fn(|request, _| match request.content_type() {
            Some(content_type) if content_type.starts_with(mime::APPLICATION_JSON.as_ref()) => Ok(()),
            _ => Err(StatusError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "json expected").into()),
        }),
    );
    router.after_all(filter_fn(|request, response| {
        info!(method = %request.method(), path = request.path(), status = %response.status(), "request served");
        Ok(())
    }));

    Ok(router)
}

// cargo run --example getting_started [config.json]
fn main() {
    let config = match env::args().nth(1) {
        Some(path) => WebConfig::from_json_file(path).expect("readable config"),
        None => {
            let mut config = WebConfig::default();
            config.server.port = 8080;
            config.session = Some(SessionConfig::default());
            config
        }
    };

    let server = Server::builder()
        .router(routes().expect("valid routes"))
        .config(config)
        .build()
        .expect("valid server")
        .start()
        .expect("server started");

    server.await_until_stop();
}
