//! Text and JSON rendering of measurement results.

use loopback_core::{AnalysisResult, TestState};

pub fn test_state_text(state: &TestState) -> String {
    format!(
        "Frequency:                  {:.0} Hz\n\
         RMS gain:                   {:.2} dB\n\
         Generated THD:              {:.4} %\n\
         Generated peak frequency:   {:.0} Hz\n\
         Recorded THD:               {:.4} %\n\
         Recorded peak frequency:    {:.0} Hz",
        state.configuration.frequency_hz,
        state.rms_gain_db,
        state.generated.thd_percent,
        state.generated.peak_frequency_hz,
        state.recorded.thd_percent,
        state.recorded.peak_frequency_hz,
    )
}

pub fn analysis_text(result: &AnalysisResult) -> String {
    format!(
        "RMS level:        {:.2} dB\n\
         Peak frequency:   {:.0} Hz\n\
         THD:              {:.4} % ({:.1} dB)",
        result.rms_db(),
        result.peak_frequency_hz,
        result.thd_percent,
        result.thd_db(),
    )
}
