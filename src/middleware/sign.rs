use anyhow::Result;
use http::{HeaderValue, Request, StatusCode};

use crate::constants;
use crate::middleware::{empty_response, BoxFuture, ClientContext, HttpResponse, Rejection, RoundTripper};
use crate::signer::Signer;

/// Terminal stage: signs the routed URI and hands it back in `X-Location`.
pub struct SignHandler {
    signer: Signer,
}

impl SignHandler {
    pub fn new(signer: Signer) -> Self {
        Self { signer }
    }

    pub fn location(&self, ctx: &ClientContext) -> String {
        let target = ctx.target();
        let path = ctx.uri.split(['?', '#']).next().unwrap_or(&ctx.uri);
        let link = self.signer.sign(path, &target.ip, &ctx.uid);
        format!("https://{}{}?{}", target.host, path, link.query())
    }
}

impl RoundTripper for SignHandler {
    fn round_trip(&self, req: Request<()>) -> BoxFuture<Result<HttpResponse>> {
        let outcome = match req.extensions().get::<ClientContext>() {
            Some(ctx) => {
                let location = self.location(ctx);
                HeaderValue::from_str(&location)
                    .map(|val| (val, ctx.clone()))
                    .map_err(|_| Rejection::BadRequest(format!("unsignable location {location:?}")))
            }
            None => Err(Rejection::Internal("request reached signing without context".to_string())),
        };
        Box::pin(async move {
            let (location, ctx) = match outcome {
                Ok(val) => val,
                Err(rejection) => return Ok(rejection.into_response()),
            };
            let mut resp = empty_response(StatusCode::OK);
            resp.headers_mut().insert(constants::LOCATION_KEY, location);
            resp.extensions_mut().insert(ctx.target());
            resp.extensions_mut().insert(ctx);
            Ok(resp)
        })
    }
}
