use h2sec_harness::testing::{context, MockDialer, ScriptedServer, Written};
use h2sec_harness::{Check, CheckError, Config};
use h2sec_traits::{ErrorCode, Event, Frame, Setting, SettingId};
use mod_slow_read::SlowRead;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sends one byte of a `body`-byte response per window update.
fn trickling_server(max_streams: u32, body: usize) -> ScriptedServer {
    let mut remaining: HashMap<u32, usize> = HashMap::new();
    ScriptedServer::new()
        .max_concurrent_streams(max_streams)
        .on_frame(move |frame| match frame {
            Frame::Data {
                stream_id,
                end_stream: true,
                ..
            } => {
                remaining.insert(*stream_id, body);
                let mut events = vec![Event::Headers {
                    stream_id: *stream_id,
                    end_stream: false,
                    length: 8,
                }];
                events.extend(next_byte(&mut remaining, *stream_id));
                events
            }
            Frame::WindowUpdate { stream_id, .. } if *stream_id != 0 => {
                next_byte(&mut remaining, *stream_id)
            }
            _ => vec![],
        })
}

fn next_byte(remaining: &mut HashMap<u32, usize>, stream_id: u32) -> Vec<Event> {
    match remaining.get_mut(&stream_id) {
        Some(left) if *left > 0 => {
            *left -= 1;
            vec![Event::Data {
                stream_id,
                end_stream: *left == 0,
                length: 1,
                flow_length: 1,
            }]
        }
        _ => vec![],
    }
}

fn config(requests: usize, concurrency: usize) -> Config {
    Config {
        requests,
        concurrency,
        ..Config::default()
    }
}

fn headers_per_conn(log: &[Written], conns: usize) -> Vec<usize> {
    (0..conns)
        .map(|conn| {
            log.iter()
                .filter(|w| w.conn == conn && matches!(w.frame, Frame::Headers { .. }))
                .count()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn window_updates_wait_for_the_interval() {
    let dialer = Arc::new(MockDialer::new(|| trickling_server(10, 3)));
    let ctx = context(config(4, 2), dialer.clone());

    SlowRead.run(ctx).await.unwrap();

    let log = dialer.log().snapshot();
    let interval = Duration::from_millis(100);
    for stream_id in [1u32, 3, 5, 7] {
        let request = log
            .iter()
            .find(|w| {
                matches!(w.frame, Frame::Data { stream_id: id, end_stream: true, .. } if id == stream_id)
            })
            .expect("request body written");
        let updates: Vec<_> = log
            .iter()
            .filter(|w| {
                matches!(w.frame, Frame::WindowUpdate { stream_id: id, increment: 1 } if id == stream_id)
            })
            .collect();
        assert_eq!(updates.len(), 2, "stream {stream_id}");

        // every byte after the first is only released by an update
        assert!(updates[0].at - request.at >= interval);
        assert!(updates[1].at - updates[0].at >= interval);
    }

    let connection_credit: u32 = log
        .iter()
        .filter_map(|w| match w.frame {
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => Some(increment),
            _ => None,
        })
        .sum();
    // credit for the last bytes may still be sleeping when the connection closes
    assert!(connection_credit >= 4 * 2);
}

#[tokio::test(start_paused = true)]
async fn window_is_shrunk_before_requests() {
    let dialer = Arc::new(MockDialer::new(|| trickling_server(10, 1)));
    let ctx = context(config(2, 2), dialer.clone());

    SlowRead.run(ctx).await.unwrap();

    let frames = dialer.log().frames_on(0);
    assert_eq!(
        frames[2],
        Frame::Settings(vec![Setting::new(SettingId::INITIAL_WINDOW_SIZE, 1)])
    );
    assert!(matches!(
        frames[3],
        Frame::Headers {
            stream_id: 1,
            end_stream: false,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn low_server_limit_opens_more_connections() {
    let dialer = Arc::new(MockDialer::new(|| trickling_server(2, 2)));
    let ctx = context(config(12, 5), dialer.clone());

    SlowRead.run(ctx).await.unwrap();

    assert_eq!(dialer.dialed(), 3);
    assert_eq!(headers_per_conn(&dialer.log().snapshot(), 3), vec![5, 5, 2]);
}

#[tokio::test(start_paused = true)]
async fn requests_never_exceed_the_share() {
    let dialer = Arc::new(MockDialer::new(|| trickling_server(100, 1)));
    let ctx = context(config(30, 10), dialer.clone());

    SlowRead.run(ctx).await.unwrap();

    assert_eq!(dialer.dialed(), 1);
    assert_eq!(headers_per_conn(&dialer.log().snapshot(), 1), vec![30]);
}

#[tokio::test(start_paused = true)]
async fn graceful_goaway_is_ignored() {
    let dialer = Arc::new(MockDialer::new(|| {
        let mut announced = false;
        ScriptedServer::new()
            .max_concurrent_streams(10)
            .on_frame(move |frame| match frame {
                Frame::Data {
                    stream_id,
                    end_stream: true,
                    ..
                } => {
                    let mut events = Vec::new();
                    if !announced {
                        announced = true;
                        events.push(Event::GoAway {
                            last_stream_id: 0,
                            error_code: ErrorCode::NO_ERROR,
                            debug_data: String::new(),
                        });
                    }
                    events.push(Event::Data {
                        stream_id: *stream_id,
                        end_stream: true,
                        length: 1,
                        flow_length: 1,
                    });
                    events
                }
                _ => vec![],
            })
    }));
    let ctx = context(config(3, 3), dialer);
    SlowRead.run(ctx).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn one_failing_connection_fails_the_check() {
    let dialed = Arc::new(AtomicUsize::new(0));
    let dialer = Arc::new(MockDialer::new(move || {
        if dialed.fetch_add(1, Ordering::SeqCst) != 1 {
            return trickling_server(2, 2);
        }
        ScriptedServer::new()
            .max_concurrent_streams(2)
            .on_frame(|frame| match frame {
                Frame::Data {
                    stream_id,
                    end_stream: true,
                    ..
                } => vec![Event::RstStream {
                    stream_id: *stream_id,
                    error_code: ErrorCode::ENHANCE_YOUR_CALM,
                }],
                _ => vec![],
            })
    }));
    let ctx = context(config(12, 6), dialer.clone());

    match SlowRead.run(ctx).await {
        Err(CheckError::Mismatch { expected, actual }) => {
            assert_eq!(expected[1], "GOAWAY Frame (Error Code: NO_ERROR)");
            assert!(actual.starts_with("RST_STREAM Frame"));
        }
        other => panic!("unexpected outcome: {:?}", other.err()),
    }
    assert_eq!(dialer.dialed(), 3);
}

#[tokio::test(start_paused = true)]
async fn missing_settings_ack_fails() {
    let dialer = Arc::new(MockDialer::new(|| {
        let mut settings_frames = 0;
        ScriptedServer::new().on_frame(move |frame| match frame {
            Frame::Settings(_) => {
                settings_frames += 1;
                if settings_frames == 2 {
                    vec![Event::ConnectionClosed]
                } else {
                    vec![]
                }
            }
            _ => vec![],
        })
    }));
    let ctx = context(config(2, 2), dialer);

    let err = SlowRead.run(ctx).await.unwrap_err();
    assert!(err.to_string().contains("SETTINGS Frame (flags:0x01)"));
}

#[tokio::test(start_paused = true)]
async fn request_frames_stay_adjacent_while_credit_is_written() {
    let dialer = Arc::new(MockDialer::new(|| trickling_server(4, 3)));
    let ctx = context(config(20, 8), dialer.clone());

    SlowRead.run(ctx).await.unwrap();

    assert_eq!(dialer.dialed(), 2);
    for conn in 0..2 {
        let frames = dialer.log().frames_on(conn);
        let headers: Vec<usize> = frames
            .iter()
            .enumerate()
            .filter(|(_, f)| matches!(f, Frame::Headers { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(headers.len(), 10);

        // later requests go out after window updates have started
        let first_update = frames
            .iter()
            .position(|f| matches!(f, Frame::WindowUpdate { .. }))
            .expect("window updates written");
        assert!(first_update < headers[headers.len() - 1]);

        for i in headers {
            let Frame::Headers { stream_id, .. } = frames[i] else {
                unreachable!()
            };
            assert!(
                matches!(frames[i + 1], Frame::Data { stream_id: id, end_stream: true, .. } if id == stream_id),
                "connection {conn}: HEADERS on stream {stream_id} not followed by its DATA"
            );
        }
    }
}
