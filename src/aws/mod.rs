pub mod imds;
