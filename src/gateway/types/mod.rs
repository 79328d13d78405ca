//! Gateway types module
//!
//! ## Submodules
//! - [`requests`]: Request bodies and query strings
//! - [`response`]: Response envelope, errors and error codes

pub mod requests;
pub mod response;

pub use requests::{
    CreateMoneyRequest, DepositRequest, ExchangeRequest, HistoryQuery, RequestIdBody,
    RequestListQuery, ReviewVerificationRequest, SendRequest, SubmitVerificationRequest,
    VerificationListQuery, WithdrawRequest,
};
pub use response::{
    ApiError, ApiResponse, ApiResult, BalanceData, ExchangeData, MoneyRequestData,
    SingleTransactionData, TransactionData, VerificationStatusData, error_codes, ok,
};
