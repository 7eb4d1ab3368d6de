mod client;

pub use client::{ApiError, ApiErrorClass, ExpenseClient, ExpenseDto, ExpensePage, remote_id_of};
