use sprout_http::config::ServerConfig;
use sprout_web::router::Router;
use sprout_web::{Server, handler_fn};

// curl -v http://127.0.0.1:3000/
fn main() {
    let mut router = Router::new();
    router
        .get(
            "/",
            handler_fn(|_, response| {
                response.set_body("hello world");
                Ok(())
            }),
        )
        .unwrap();

    let server = Server::builder()
        .router(router)
        .server_config(ServerConfig { port: 3000, ..ServerConfig::default() })
        .build()
        .unwrap()
        .start()
        .unwrap();

    server.await_until_stop();
}
