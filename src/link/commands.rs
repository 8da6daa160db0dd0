//! Device command surface.
//!
//! Each method builds one protocol token and sends it through
//! [`LinkClient::send_token`], returning the body of the correlated response.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::link::client::{LinkClient, LinkError};
use crate::link::proto::{CpuTemperature, MagData, MotorData, CPU_TEMP_DATA, MAG_DATA, MOTOR_DATA};
use crate::link::router::Telemetry;
use crate::link::token::Token;

pub const ECHO: &str = "ECHO";
pub const READ_MAG: &str = "READMAG";
pub const START_MAG_STREAM: &str = "STARTMAGSTREAM";
pub const STOP_MAG_STREAM: &str = "STOPMAGSTREAM";
pub const CONTROLLER_DATA: &str = "CONTROLLERDATA";
pub const READ_CPU_TEMP: &str = "READCPUTEMP";
pub const START_TEMP_STREAM: &str = "STARTTEMPSTREAM";
pub const STOP_TEMP_STREAM: &str = "STOPTEMPSTREAM";
pub const DEPTH_LOCK: &str = "DEPTHLOCK";
pub const TEST_ILLUMINATION: &str = "TESTILLUMINATION";
pub const TUNE_PID: &str = "TUNEPID";

/// Pilot stick input, each axis normalised to `-1.0..=1.0`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ControllerData {
    pub surge: f64,
    pub sway: f64,
    pub heave: f64,
    pub yaw: f64,
}

/// Control loop tuned by [`LinkClient::tune_pid`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PidAxis {
    Depth,
    Heading,
    Pitch,
    Roll,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PidConstants {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

impl LinkClient {
    /// Asks the device to send `payload` straight back.
    pub async fn echo(&self, payload: Value) -> Result<Value, LinkError> {
        self.send_token(&echo_token(payload)).await
    }

    /// Reads one magnetometer sample.
    pub async fn read_mag(&self) -> Result<Value, LinkError> {
        self.send_token(&Token::new(READ_MAG, Value::Null)).await
    }

    /// Starts periodic magnetometer telemetry, see [`Self::subscribe_mag_data`].
    pub async fn start_mag_stream(&self, interval: Duration) -> Result<Value, LinkError> {
        self.send_token(&stream_start_token(START_MAG_STREAM, interval))
            .await
    }

    pub async fn stop_mag_stream(&self) -> Result<Value, LinkError> {
        self.send_token(&Token::new(STOP_MAG_STREAM, Value::Null))
            .await
    }

    pub async fn send_controller_data(&self, data: &ControllerData) -> Result<Value, LinkError> {
        self.send_token(&Token::new(CONTROLLER_DATA, serde_json::to_value(data)?))
            .await
    }

    pub async fn read_cpu_temp(&self) -> Result<Value, LinkError> {
        self.send_token(&Token::new(READ_CPU_TEMP, Value::Null))
            .await
    }

    /// Starts periodic CPU temperature telemetry.
    pub async fn start_temp_stream(&self, interval: Duration) -> Result<Value, LinkError> {
        self.send_token(&stream_start_token(START_TEMP_STREAM, interval))
            .await
    }

    pub async fn stop_temp_stream(&self) -> Result<Value, LinkError> {
        self.send_token(&Token::new(STOP_TEMP_STREAM, Value::Null))
            .await
    }

    /// Holds the current depth when `enabled`, releases it otherwise.
    pub async fn set_depth_lock(&self, enabled: bool) -> Result<Value, LinkError> {
        self.send_token(&Token::new(DEPTH_LOCK, json!({ "enabled": enabled })))
            .await
    }

    pub async fn send_test_illumination(&self) -> Result<Value, LinkError> {
        self.send_token(&Token::new(TEST_ILLUMINATION, Value::Null))
            .await
    }

    pub async fn tune_pid(
        &self,
        axis: PidAxis,
        constants: PidConstants,
    ) -> Result<Value, LinkError> {
        self.send_token(&tune_pid_token(axis, constants)?).await
    }

    /// Sends a command this SDK has no dedicated method for.
    pub async fn send_special_command(
        &self,
        command: impl Into<String>,
        body: Value,
    ) -> Result<Value, LinkError> {
        self.send_token(&Token::new(command, body)).await
    }

    pub fn subscribe_mag_data(&self) -> Telemetry<MagData> {
        self.subscribe(MAG_DATA).typed()
    }

    pub fn subscribe_cpu_temperature(&self) -> Telemetry<CpuTemperature> {
        self.subscribe(CPU_TEMP_DATA).typed()
    }

    pub fn subscribe_motor_data(&self) -> Telemetry<MotorData> {
        self.subscribe(MOTOR_DATA).typed()
    }
}

fn echo_token(payload: Value) -> Token {
    Token::new(ECHO, payload)
}

fn stream_start_token(command: &str, interval: Duration) -> Token {
    let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    Token::new(command, json!({ "interval": interval_ms }))
}

fn tune_pid_token(axis: PidAxis, constants: PidConstants) -> Result<Token, serde_json::Error> {
    let mut body = serde_json::to_value(constants)?;
    if let Value::Object(fields) = &mut body {
        fields.insert("axis".to_string(), serde_json::to_value(axis)?);
    }
    Ok(Token::new(TUNE_PID, body))
}
