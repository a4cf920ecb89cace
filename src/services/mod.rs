pub mod booking_view;
pub mod catalog;
pub mod confirmation;
pub mod draft;
pub mod gateway;
pub mod intent;

#[cfg(test)]
pub(crate) mod test_support;
