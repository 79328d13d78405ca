//! OpenAPI / Swagger UI Documentation
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::gateway::handlers::HealthResponse;
use crate::gateway::types::{
    CreateMoneyRequest, DepositRequest, ExchangeRequest, RequestIdBody, ReviewVerificationRequest,
    SendRequest, SubmitVerificationRequest, WithdrawRequest,
};

/// HS256 JWT bearer authentication
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some(
                            "Token issued by the identity service. Claims: sub (user id), role (user | admin), exp, iat.",
                        ))
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Wallet Ledger API",
        version = "1.0.0",
        description = "Multi-currency wallet: balances, transaction journal, verification-gated transfers and payment processor settlement.",
        license(
            name = "MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::health::health_check,
        crate::gateway::handlers::transactions::deposit,
        crate::gateway::handlers::transactions::withdraw,
        crate::gateway::handlers::transactions::send,
        crate::gateway::handlers::transactions::exchange,
        crate::gateway::handlers::transactions::balance,
        crate::gateway::handlers::transactions::history,
        crate::gateway::handlers::transactions::get_transaction,
        crate::gateway::handlers::transactions::cancel_deposit,
        crate::gateway::handlers::requests::create_request,
        crate::gateway::handlers::requests::pay_request,
        crate::gateway::handlers::requests::reject_request,
        crate::gateway::handlers::requests::list_requests,
        crate::gateway::handlers::verification::submit,
        crate::gateway::handlers::verification::status,
        crate::gateway::handlers::verification::admin_list,
        crate::gateway::handlers::verification::admin_review,
        crate::gateway::handlers::webhook::payment_webhook,
    ),
    components(
        schemas(
            HealthResponse,
            DepositRequest,
            WithdrawRequest,
            SendRequest,
            ExchangeRequest,
            CreateMoneyRequest,
            RequestIdBody,
            SubmitVerificationRequest,
            ReviewVerificationRequest,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Transactions", description = "Balance-moving operations and history (auth required)"),
        (name = "Money Requests", description = "Request / pay / reject flows (auth required)"),
        (name = "Verification", description = "Identity and license documents (auth required)"),
        (name = "Admin", description = "Verification review (admin role required)"),
        (name = "Webhooks", description = "Signed payment processor callbacks"),
        (name = "System", description = "Health checks")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use utoipa::OpenApi;

    #[test]
    fn test_openapi_spec_generates() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "Wallet Ledger API");
        assert!(spec.to_json().is_ok());
    }

    #[test]
    fn test_paths_registered() {
        let paths = ApiDoc::openapi().paths.paths;
        assert!(paths.contains_key("/api/v1/health"));
        assert!(paths.contains_key("/api/v1/transactions/deposit"));
        assert!(paths.contains_key("/api/v1/admin/verifications/{kind}/{id}"));
        assert!(paths.contains_key("/api/v1/webhooks/payment"));
    }

    #[test]
    fn test_security_scheme_registered() {
        let components = ApiDoc::openapi().components.expect("should have components");
        assert!(components.security_schemes.contains_key("bearer_auth"));
    }
}
