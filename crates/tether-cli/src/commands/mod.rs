pub mod login;
pub mod logout;
pub mod run;
pub mod status;
